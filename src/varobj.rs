//! The variable-object cache: GDB varobjs are stateful and costly to
//! create, so repeated DAP `variables` requests are coalesced onto a
//! stable set of them, keyed by the call-stack context they were created
//! in. See `4.4`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::mi::GDB;
use crate::mi::commands::MiCommand;

/// A type whose name contains `[N]` is treated as array-typed: GDB reports
/// its children's raw `exp` field as a bare index (`[0]`, `[1]`, ...) which
/// only makes sense qualified by the parent expression.
static ARRAY_TYPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r".*\[\d+\].*").unwrap());

type CacheKey = (i64, i64, i64, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarObj {
    /// Debugger-assigned identifier, opaque and stable for this varobj's
    /// lifetime.
    pub varname: String,
    /// Source-visible name the user sees; may be synthesized (`arr[2]`).
    pub expression: String,
    pub r#type: String,
    pub value: String,
    pub numchild: i64,
    /// True for a top-level local listed by `-stack-list-variables`.
    pub is_var: bool,
    /// True for an entry drilled into from a parent (field, element).
    pub is_child: bool,
}

impl VarObj {
    pub fn is_array(&self) -> bool {
        ARRAY_TYPE.is_match(&self.r#type)
    }

    /// The name to render for a child of this varobj, array-aware: array
    /// children are qualified as `{parent}[{index}]` rather than handed to
    /// the user as the bare index GDB reports.
    pub fn child_display_name(&self, child_raw_expr: &str) -> String {
        if self.is_array() {
            let index = child_raw_expr.trim_matches(|c| c == '[' || c == ']');
            format!("{}[{}]", self.expression, index)
        } else if self.expression.is_empty() {
            child_raw_expr.to_string()
        } else {
            format!("{}.{}", self.expression, child_raw_expr)
        }
    }
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

/// Keyed `(threadId, frameId, stackDepth, expression) -> VarObj` store.
/// Depth participates in the key so a varobj from a deeper call never
/// collides with a same-named variable at a shallower frame.
#[derive(Debug, Default)]
pub struct VarObjCache {
    entries: HashMap<CacheKey, VarObj>,
}

impl VarObjCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, thread: i64, frame: i64, depth: i64, expression: &str) -> Option<&VarObj> {
        self.entries.get(&(thread, frame, depth, expression.to_string()))
    }

    /// Builds and stores a new entry from a `-var-create` result, replacing
    /// any prior entry under the identical key.
    pub fn add(
        &mut self,
        thread: i64,
        frame: i64,
        depth: i64,
        expression: &str,
        is_var: bool,
        is_child: bool,
        create_result: &Value,
    ) -> AppResult<VarObj> {
        let varname = str_field(create_result, "name")
            .ok_or_else(|| AppError::Protocol("var-create result missing name".to_string()))?
            .to_string();
        let r#type = str_field(create_result, "type").unwrap_or_default().to_string();
        let value = str_field(create_result, "value").unwrap_or_default().to_string();
        let numchild = str_field(create_result, "numchild")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let var_obj = VarObj {
            varname,
            expression: expression.to_string(),
            r#type,
            value,
            numchild,
            is_var,
            is_child,
        };
        self.entries
            .insert((thread, frame, depth, expression.to_string()), var_obj.clone());
        Ok(var_obj)
    }

    /// Applies a parsed `-var-update` result to the cached entry for `key`.
    /// Returns the varobj name to issue `-var-delete` for if the changelist
    /// reported it out of scope; kept pure (no GDB access) so the scope
    /// transition itself is unit-testable.
    fn apply_update(&mut self, key: &CacheKey, result: &Value) -> Option<String> {
        let varname = self.entries.get(key)?.varname.clone();
        let changelist = result.get("changelist").and_then(Value::as_array);
        for change in changelist.into_iter().flatten() {
            if str_field(change, "name") != Some(varname.as_str()) {
                continue;
            }
            let in_scope = str_field(change, "in_scope").unwrap_or("true");
            if in_scope == "false" {
                self.entries.remove(key);
                return Some(varname);
            }
            if let Some(value) = str_field(change, "value") {
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.value = value.to_string();
                }
            }
        }
        None
    }

    /// Issues `-var-update` for the cached entry's varname. On an
    /// `in_scope="false"` changelist entry, evicts the entry and issues
    /// `-var-delete`; the caller is expected to recreate it. Returns `None`
    /// if no entry was cached for this key, or if it went out of scope.
    pub async fn update(
        &mut self,
        gdb: &GDB,
        thread: i64,
        frame: i64,
        depth: i64,
        expression: &str,
    ) -> AppResult<Option<VarObj>> {
        let key = (thread, frame, depth, expression.to_string());
        let varname = match self.entries.get(&key) {
            Some(entry) => entry.varname.clone(),
            None => return Ok(None),
        };
        let result = gdb
            .execute(MiCommand::var_update(Some(thread as u64), varname))
            .await?;
        if let Some(stale) = self.apply_update(&key, &result.results) {
            let _ = gdb.execute(MiCommand::var_delete(stale, false)).await;
            return Ok(None);
        }
        Ok(self.entries.get(&key).cloned())
    }

    /// Evicts the entry matching `(thread, frame, depth, varname)` and
    /// issues `-var-delete` for it.
    pub async fn remove(
        &mut self,
        gdb: &GDB,
        thread: i64,
        frame: i64,
        depth: i64,
        varname: &str,
    ) -> AppResult<()> {
        self.entries
            .retain(|k, v| !(k.0 == thread && k.1 == frame && k.2 == depth && v.varname == varname));
        gdb.execute(MiCommand::var_delete(varname.to_string(), false))
            .await?;
        Ok(())
    }

    /// All top-level (`isVar`) entries cached for this stack context, the
    /// set iterated when rendering a frame's "Local" scope.
    pub fn top_level_for(&self, thread: i64, frame: i64, depth: i64) -> impl Iterator<Item = &VarObj> {
        self.entries
            .iter()
            .filter(move |(k, v)| k.0 == thread && k.1 == frame && k.2 == depth && v.is_var)
            .map(|(_, v)| v)
    }

    /// Looks up an entry by GDB varname within this stack context, regardless
    /// of whether it's a top-level local or a drilled-into child. Used to
    /// find a parent varobj when naming its children: a parent that is
    /// itself a child (e.g. `r.z` drilled from `r`) has `is_var == false`
    /// and would never be found by `top_level_for` alone.
    pub fn by_varname(&self, thread: i64, frame: i64, depth: i64, varname: &str) -> Option<&VarObj> {
        self.entries
            .iter()
            .find(|(k, v)| k.0 == thread && k.1 == frame && k.2 == depth && v.varname == varname)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn create_result(name: &str, r#type: &str, value: &str, numchild: &str) -> Value {
        json!({ "name": name, "type": r#type, "value": value, "numchild": numchild })
    }

    #[test]
    fn add_then_get_returns_the_same_entry() {
        let mut cache = VarObjCache::new();
        let created = create_result("var1", "int", "1", "0");
        let added = cache.add(1, 0, 2, "a", true, false, &created).unwrap();
        let got = cache.get(1, 0, 2, "a").unwrap();
        assert_eq!(got, &added);
        assert_eq!(got.varname, "var1");
    }

    #[test]
    fn depth_participates_in_the_key() {
        let mut cache = VarObjCache::new();
        let created = create_result("var1", "int", "1", "0");
        cache.add(1, 0, 2, "a", true, false, &created).unwrap();
        assert!(cache.get(1, 0, 3, "a").is_none());
    }

    #[test]
    fn add_overwrites_prior_entry_with_identical_key() {
        let mut cache = VarObjCache::new();
        cache
            .add(1, 0, 0, "a", true, false, &create_result("var1", "int", "1", "0"))
            .unwrap();
        cache
            .add(1, 0, 0, "a", true, false, &create_result("var2", "int", "9", "0"))
            .unwrap();
        assert_eq!(cache.get(1, 0, 0, "a").unwrap().varname, "var2");
    }

    #[test]
    fn apply_update_refreshes_value_when_in_scope() {
        let mut cache = VarObjCache::new();
        cache
            .add(1, 0, 0, "a", true, false, &create_result("var1", "int", "1", "0"))
            .unwrap();
        let key = (1, 0, 0, "a".to_string());
        let result = json!({ "changelist": [{ "name": "var1", "value": "25", "in_scope": "true" }] });
        let stale = cache.apply_update(&key, &result);
        assert_eq!(stale, None);
        assert_eq!(cache.get(1, 0, 0, "a").unwrap().value, "25");
    }

    #[test]
    fn apply_update_evicts_when_out_of_scope() {
        let mut cache = VarObjCache::new();
        cache
            .add(1, 0, 0, "a", true, false, &create_result("var1", "int", "1", "0"))
            .unwrap();
        let key = (1, 0, 0, "a".to_string());
        let result = json!({ "changelist": [{ "name": "var1", "in_scope": "false" }] });
        let stale = cache.apply_update(&key, &result);
        assert_eq!(stale, Some("var1".to_string()));
        assert!(cache.get(1, 0, 0, "a").is_none());
    }

    #[test]
    fn array_type_detection_and_child_naming() {
        let arr = VarObj {
            varname: "var2".to_string(),
            expression: "f".to_string(),
            r#type: "int [3]".to_string(),
            value: "{1, 2, 3}".to_string(),
            numchild: 3,
            is_var: true,
            is_child: false,
        };
        assert!(arr.is_array());
        assert_eq!(arr.child_display_name("[0]"), "f[0]");
        assert_eq!(arr.child_display_name("1"), "f[1]");

        let structured = VarObj {
            varname: "var3".to_string(),
            expression: "r".to_string(),
            r#type: "struct foo".to_string(),
            value: "{...}".to_string(),
            numchild: 2,
            is_var: true,
            is_child: false,
        };
        assert!(!structured.is_array());
        assert_eq!(structured.child_display_name("x"), "r.x");
    }

    #[test]
    fn top_level_for_filters_by_context_and_is_var() {
        let mut cache = VarObjCache::new();
        cache
            .add(1, 0, 0, "a", true, false, &create_result("var1", "int", "1", "0"))
            .unwrap();
        cache
            .add(1, 0, 0, "a.x", false, true, &create_result("var1.x", "int", "1", "0"))
            .unwrap();
        cache
            .add(1, 1, 0, "b", true, false, &create_result("var4", "int", "1", "0"))
            .unwrap();

        let names: Vec<_> = cache.top_level_for(1, 0, 0).map(|v| v.expression.clone()).collect();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[test]
    fn by_varname_finds_a_child_parent_that_top_level_for_would_miss() {
        let mut cache = VarObjCache::new();
        // top-level `a`
        cache
            .add(1, 0, 0, "a", true, false, &create_result("var1", "int", "1", "0"))
            .unwrap();
        // `r`, drilled into `r.z`, which is itself a child (is_var = false)
        cache
            .add(1, 0, 0, "r.z", false, true, &create_result("var2.z", "struct foo", "{...}", "2"))
            .unwrap();

        // `by_varname` must find the child-parent `r.z` by its GDB varname,
        // something `top_level_for` can't do since it filters on `is_var`.
        let parent = cache.by_varname(1, 0, 0, "var2.z").unwrap();
        assert_eq!(parent.expression, "r.z");

        // and a grandchild named `a` drilled from it must not collide with
        // the unrelated top-level `a` above.
        let display_name = parent.child_display_name("a");
        assert_eq!(display_name, "r.z.a");
        assert_ne!(display_name, "a");
    }
}
