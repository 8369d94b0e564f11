//! Bounded FIFO of serialized frames awaiting a usable connection.

use std::collections::VecDeque;

use tether_core::ClientError;
use tether_settings::{OverflowPolicy, QueueSettings};
use tokio::time::Instant;

/// A frame waiting to be written.
#[derive(Clone, Debug)]
pub struct QueuedMessage {
    /// Serialized frame.
    pub payload: String,
    /// When it was queued.
    pub enqueued_at: Instant,
}

/// Outcome of a successful [`OutboundQueue::push`].
#[derive(Debug)]
pub enum Enqueued {
    /// Appended without side effects.
    Appended,
    /// Appended after evicting the oldest message.
    Evicted(QueuedMessage),
}

/// Bounded outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<QueuedMessage>,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl OutboundQueue {
    /// Create a queue from settings.
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: settings.capacity.max(1),
            overflow: settings.overflow,
        }
    }

    /// Append a frame, applying the overflow policy when full.
    pub fn push(&mut self, payload: String) -> Result<Enqueued, ClientError> {
        let message = QueuedMessage {
            payload,
            enqueued_at: Instant::now(),
        };
        if self.items.len() < self.capacity {
            self.items.push_back(message);
            return Ok(Enqueued::Appended);
        }
        match self.overflow {
            OverflowPolicy::RejectNew => Err(ClientError::QueueFull {
                capacity: self.capacity,
            }),
            OverflowPolicy::DropOldest => {
                let evicted = self.items.pop_front();
                self.items.push_back(message);
                Ok(evicted.map_or(Enqueued::Appended, Enqueued::Evicted))
            }
        }
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    /// Put frames back at the head, preserving their order.
    ///
    /// Used when a connection drops with frames accepted but not yet written.
    /// These were already accepted, so capacity is not enforced here.
    pub fn requeue_front(&mut self, payloads: Vec<String>) {
        let now = Instant::now();
        for payload in payloads.into_iter().rev() {
            self.items.push_front(QueuedMessage {
                payload,
                enqueued_at: now,
            });
        }
    }

    /// Remove the first frame equal to `payload`. Returns whether one was
    /// found.
    pub fn remove(&mut self, payload: &str) -> bool {
        match self.items.iter().position(|m| m.payload == payload) {
            Some(index) => self.items.remove(index).is_some(),
            None => false,
        }
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn queue(capacity: usize, overflow: OverflowPolicy) -> OutboundQueue {
        OutboundQueue::new(&QueueSettings { capacity, overflow })
    }

    fn payloads(q: &mut OutboundQueue) -> Vec<String> {
        q.drain().into_iter().map(|m| m.payload).collect()
    }

    #[test]
    fn drains_in_fifo_order() {
        let mut q = queue(10, OverflowPolicy::RejectNew);
        for p in ["A", "B", "C"] {
            assert_matches!(q.push(p.into()), Ok(Enqueued::Appended));
        }
        assert_eq!(payloads(&mut q), vec!["A", "B", "C"]);
        assert!(q.is_empty());
    }

    #[test]
    fn remove_takes_one_frame_and_keeps_order() {
        let mut q = queue(10, OverflowPolicy::RejectNew);
        for p in ["A", "B", "C"] {
            let _ = q.push(p.into()).unwrap();
        }
        assert!(q.remove("B"));
        assert!(!q.remove("B"));
        assert!(!q.remove("Z"));
        assert_eq!(payloads(&mut q), vec!["A", "C"]);
    }

    #[test]
    fn reject_new_when_full() {
        let mut q = queue(2, OverflowPolicy::RejectNew);
        let _ = q.push("A".into()).unwrap();
        let _ = q.push("B".into()).unwrap();
        assert_matches!(
            q.push("C".into()),
            Err(ClientError::QueueFull { capacity: 2 })
        );
        assert_eq!(payloads(&mut q), vec!["A", "B"]);
    }

    #[test]
    fn drop_oldest_when_full() {
        let mut q = queue(2, OverflowPolicy::DropOldest);
        let _ = q.push("A".into()).unwrap();
        let _ = q.push("B".into()).unwrap();
        let evicted = q.push("C".into()).unwrap();
        assert_matches!(evicted, Enqueued::Evicted(m) if m.payload == "A");
        assert_eq!(payloads(&mut q), vec!["B", "C"]);
    }

    #[test]
    fn requeue_goes_ahead_of_existing() {
        let mut q = queue(10, OverflowPolicy::RejectNew);
        let _ = q.push("C".into()).unwrap();
        q.requeue_front(vec!["A".into(), "B".into()]);
        assert_eq!(q.len(), 3);
        assert_eq!(payloads(&mut q), vec!["A", "B", "C"]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut q = queue(0, OverflowPolicy::RejectNew);
        assert!(q.push("A".into()).is_ok());
        assert!(q.push("B".into()).is_err());
    }

    #[test]
    fn clear_discards() {
        let mut q = queue(10, OverflowPolicy::RejectNew);
        let _ = q.push("A".into()).unwrap();
        q.clear();
        assert!(q.is_empty());
    }
}
