//! Correlation table matching outbound requests to inbound responses.
//!
//! Pure bookkeeping, no I/O. Each [`PendingRequest`] owns the sending half of
//! a oneshot channel; the caller awaits the receiving half. An entry leaves
//! the table exactly once: whoever removes it (response, timeout, or
//! cancellation) is the only party allowed to act on it, and every other
//! party observes an absent entry and does nothing.

use std::collections::HashMap;

use serde_json::Value;
use tether_core::{ClientError, RequestId};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Outcome delivered to a waiting request.
pub type Settlement = Result<Value, ClientError>;

/// An in-flight request.
#[derive(Debug)]
pub struct PendingRequest {
    /// Correlation id.
    pub id: RequestId,
    /// Method that was called.
    pub method: String,
    /// Parameters that were sent.
    pub params: Value,
    /// When the request was registered.
    pub created_at: Instant,
    settle: oneshot::Sender<Settlement>,
}

impl PendingRequest {
    /// Deliver the outcome. Consumes the entry so it cannot settle twice.
    fn settle(self, outcome: Settlement) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.settle.send(outcome);
    }
}

/// The correlation table.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<RequestId, PendingRequest>,
}

impl Correlator {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry under a fresh id.
    pub fn register(
        &mut self,
        method: &str,
        params: Value,
    ) -> (RequestId, oneshot::Receiver<Settlement>) {
        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        let entry = PendingRequest {
            id: id.clone(),
            method: method.to_owned(),
            params,
            created_at: Instant::now(),
            settle: tx,
        };
        let _ = self.pending.insert(id.clone(), entry);
        metrics::gauge!("realtime_pending_requests").increment(1.0);
        (id, rx)
    }

    /// Remove the entry for `id` and settle it with `outcome`.
    ///
    /// Returns `false` when the entry was already gone (timed out or
    /// cancelled), in which case `outcome` is discarded.
    pub fn resolve(&mut self, id: &RequestId, outcome: Settlement) -> bool {
        match self.remove(id) {
            Some(entry) => {
                entry.settle(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `id` without settling it.
    ///
    /// Used by the timeout and cancellation paths, which report the outcome
    /// to the caller directly.
    pub fn remove(&mut self, id: &RequestId) -> Option<PendingRequest> {
        let entry = self.pending.remove(id);
        if entry.is_some() {
            metrics::gauge!("realtime_pending_requests").decrement(1.0);
        }
        entry
    }

    /// Settle every entry with a clone of `error` and empty the table.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&mut self, error: &ClientError) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            metrics::gauge!("realtime_pending_requests").decrement(1.0);
            entry.settle(Err(error.clone()));
        }
        count
    }

    /// Whether `id` is still awaiting settlement.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of in-flight requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no requests are in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_settles_and_removes() {
        let mut table = Correlator::new();
        let (id, rx) = table.register("echo", json!({"msg": "hi"}));
        assert!(table.contains(&id));

        assert!(table.resolve(&id, Ok(json!("hi"))));
        assert!(!table.contains(&id));
        assert_eq!(rx.await.unwrap().unwrap(), json!("hi"));
    }

    #[tokio::test]
    async fn second_resolve_is_ignored() {
        let mut table = Correlator::new();
        let (id, rx) = table.register("echo", Value::Null);
        assert!(table.resolve(&id, Ok(json!(1))));
        assert!(!table.resolve(&id, Ok(json!(2))));
        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
    }

    #[test]
    fn resolve_after_remove_is_ignored() {
        let mut table = Correlator::new();
        let (id, _rx) = table.register("echo", Value::Null);
        let removed = table.remove(&id).unwrap();
        assert_eq!(removed.method, "echo");
        assert!(!table.resolve(&id, Ok(Value::Null)));
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_id_is_ignored() {
        let mut table = Correlator::new();
        assert!(!table.resolve(&RequestId::from("nope"), Ok(Value::Null)));
        assert!(table.remove(&RequestId::from("nope")).is_none());
    }

    #[tokio::test]
    async fn fail_all_settles_everything_once() {
        let mut table = Correlator::new();
        let (_, rx1) = table.register("a", Value::Null);
        let (_, rx2) = table.register("b", Value::Null);

        let err = ClientError::Cancelled("disconnect requested".into());
        assert_eq!(table.fail_all(&err), 2);
        assert!(table.is_empty());
        assert_eq!(table.fail_all(&err), 0);

        assert_matches!(rx1.await.unwrap(), Err(ClientError::Cancelled(_)));
        assert_matches!(rx2.await.unwrap(), Err(ClientError::Cancelled(_)));
    }

    #[test]
    fn resolve_with_dropped_receiver_still_removes() {
        let mut table = Correlator::new();
        let (id, rx) = table.register("echo", Value::Null);
        drop(rx);
        assert!(table.resolve(&id, Ok(Value::Null)));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn ids_are_unique_per_registration() {
        let mut table = Correlator::new();
        let (a, _ra) = table.register("m", Value::Null);
        let (b, _rb) = table.register("m", Value::Null);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }
}
