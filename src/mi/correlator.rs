use std::collections::HashMap;

use tokio::sync::oneshot;

use super::output::ResultRecord;
use crate::error::AppError;

type Completion = Result<ResultRecord, AppError>;

/// Maps an in-flight command's token to the one-shot slot awaiting its
/// result record. A slot is created when a command is written and removed
/// the moment a matching result record arrives, or when the transport
/// closes and every outstanding slot is failed at once.
#[derive(Default)]
pub struct Correlator {
    pending: HashMap<u64, oneshot::Sender<Completion>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending slot for `token`, returning the receiver half the
    /// caller awaits. Tokens are never reused within a session, so a second
    /// `register` for the same token would silently replace the first --
    /// callers must allocate tokens from a single monotonic counter.
    pub fn register(&mut self, token: u64) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token, tx);
        rx
    }

    /// Completes the slot for `token`, if one is pending. Returns false for
    /// an unknown token (the result record is unsolicited, or the receiver
    /// was a fire-and-forget send whose slot was never registered).
    pub fn complete(&mut self, token: u64, result: Completion) -> bool {
        match self.pending.remove(&token) {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding slot with `TransportClosed`, draining the
    /// table. Called once the debugger process or its stdout pipe is gone.
    pub fn fail_all_closed(&mut self) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(AppError::TransportClosed));
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mi::output::ResultClass;
    use serde_json::Value;

    fn fake_record(token: Option<u64>) -> ResultRecord {
        ResultRecord {
            token,
            class: ResultClass::Done,
            results: Value::Object(Default::default()),
        }
    }

    #[tokio::test]
    async fn completes_exactly_one_pending_slot_per_token() {
        let mut correlator = Correlator::new();
        let rx1 = correlator.register(1);
        let rx2 = correlator.register(2);
        assert_eq!(correlator.pending_count(), 2);

        assert!(correlator.complete(1, Ok(fake_record(Some(1)))));
        assert_eq!(correlator.pending_count(), 1);

        let got = rx1.await.expect("slot 1 dropped").expect("result ok");
        assert_eq!(got.token, Some(1));

        assert!(correlator.complete(2, Ok(fake_record(Some(2)))));
        let got = rx2.await.expect("slot 2 dropped").expect("result ok");
        assert_eq!(got.token, Some(2));
    }

    #[test]
    fn completing_an_unknown_token_is_a_noop() {
        let mut correlator = Correlator::new();
        assert!(!correlator.complete(99, Ok(fake_record(Some(99)))));
    }

    #[tokio::test]
    async fn fail_all_closed_fails_every_outstanding_slot() {
        let mut correlator = Correlator::new();
        let rx1 = correlator.register(1);
        let rx2 = correlator.register(2);
        correlator.fail_all_closed();
        assert_eq!(correlator.pending_count(), 0);
        assert!(matches!(rx1.await.unwrap(), Err(AppError::TransportClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(AppError::TransportClosed)));
    }

    #[tokio::test]
    async fn interleaved_sends_each_get_their_own_result() {
        let mut correlator = Correlator::new();
        let receivers: Vec<_> = (0..8).map(|t| correlator.register(t)).collect();
        // complete out of order
        for t in [3, 1, 0, 7, 2, 6, 4, 5] {
            assert!(correlator.complete(t, Ok(fake_record(Some(t)))));
        }
        for (t, rx) in receivers.into_iter().enumerate() {
            let got = rx.await.unwrap().unwrap();
            assert_eq!(got.token, Some(t as u64));
        }
    }
}
