//! Opaque integer handles the DAP session hands to the client for stack
//! frames and variable references, and the generational tables that back
//! them. Every debugger stop mints a fresh generation: the tables are
//! cleared, but the id counter keeps climbing, so a handle issued before a
//! stop can never coincidentally match one issued after it.

use std::collections::HashMap;

/// Value stored behind a frame handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRef {
    pub thread_id: i64,
    pub frame_id: i64,
}

/// Value stored behind a variable handle: either the "Local" scope of a
/// frame, or a specific varobj's children.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarRef {
    Frame { frame_handle: i64 },
    Object { frame_handle: i64, varobj_name: String },
}

/// A monotonically allocated integer -> value map that empties on `reset`
/// without rewinding its counter, so a handle from a previous generation is
/// rejected by absence rather than by accidentally aliasing a fresh one.
#[derive(Debug)]
pub struct HandleTable<T> {
    next: i64,
    entries: HashMap<i64, T>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a new handle for `value` and stores it.
    pub fn alloc(&mut self, value: T) -> i64 {
        let handle = self.next;
        self.next += 1;
        self.entries.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: i64) -> Option<&T> {
        self.entries.get(&handle)
    }

    /// Clears every entry. Already-issued handles are not reused because
    /// `next` is untouched.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The pair of handle tables a DAP session keeps, reset together on every
/// `stopped` event per `4.5`.
#[derive(Debug, Default)]
pub struct HandleTables {
    pub frames: HandleTable<FrameRef>,
    pub vars: HandleTable<VarRef>,
}

impl HandleTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets both tables. Must run before the `stopped` event this stop
    /// produces is made visible to request handlers.
    pub fn reset_on_stop(&mut self) {
        self.frames.reset();
        self.vars.reset();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_returns_distinct_increasing_handles() {
        let mut table = HandleTable::new();
        let a = table.alloc(FrameRef { thread_id: 1, frame_id: 0 });
        let b = table.alloc(FrameRef { thread_id: 1, frame_id: 1 });
        assert!(b > a);
        assert_eq!(table.get(a), Some(&FrameRef { thread_id: 1, frame_id: 0 }));
        assert_eq!(table.get(b), Some(&FrameRef { thread_id: 1, frame_id: 1 }));
    }

    #[test]
    fn reset_rejects_handles_from_before_it_by_absence() {
        let mut table = HandleTable::new();
        let stale = table.alloc(FrameRef { thread_id: 1, frame_id: 0 });
        table.reset();
        assert_eq!(table.get(stale), None);
        let fresh = table.alloc(FrameRef { thread_id: 2, frame_id: 0 });
        assert_ne!(stale, fresh);
        assert_eq!(table.get(fresh), Some(&FrameRef { thread_id: 2, frame_id: 0 }));
    }

    #[test]
    fn reset_never_reuses_a_previously_issued_id() {
        let mut table: HandleTable<()> = HandleTable::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let h = table.alloc(());
            assert!(seen.insert(h), "handle {} reused across generations", h);
            table.reset();
        }
    }

    #[test]
    fn handle_tables_reset_on_stop_clears_both() {
        let mut tables = HandleTables::new();
        let fh = tables.frames.alloc(FrameRef { thread_id: 1, frame_id: 0 });
        let vh = tables.vars.alloc(VarRef::Frame { frame_handle: fh });
        tables.reset_on_stop();
        assert_eq!(tables.frames.get(fh), None);
        assert_eq!(tables.vars.get(vh), None);
    }
}
