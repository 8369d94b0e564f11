//! Channel subscription registry.
//!
//! Maps channel names to an ordered list of handlers. The registry only does
//! bookkeeping; the client decides when a change needs a `subscribe` or
//! `unsubscribe` envelope based on the [`AddOutcome`] / [`RemoveOutcome`]
//! returned here.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tether_core::SubscriptionId;
use tracing::error;

/// Callback invoked with the `data` of each push on a channel.
pub type ChannelHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    handler: ChannelHandler,
}

/// Result of [`ChannelRegistry::add`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddOutcome {
    /// Id identifying the new registration.
    pub id: SubscriptionId,
    /// Whether this is the channel's first live handler.
    pub first_on_channel: bool,
}

/// Result of [`ChannelRegistry::remove`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// No such registration (already removed).
    NotFound,
    /// Removed; other handlers remain on the channel.
    Removed,
    /// Removed the channel's last handler.
    RemovedLast,
}

/// Registered channel handlers, in registration order per channel.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Vec<Subscriber>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on `channel`.
    pub fn add(&mut self, channel: &str, handler: ChannelHandler) -> AddOutcome {
        let id = SubscriptionId::new();
        let subscribers = self.channels.entry(channel.to_owned()).or_default();
        let first_on_channel = subscribers.is_empty();
        subscribers.push(Subscriber {
            id: id.clone(),
            handler,
        });
        AddOutcome {
            id,
            first_on_channel,
        }
    }

    /// Remove the registration `id` from `channel`.
    pub fn remove(&mut self, channel: &str, id: &SubscriptionId) -> RemoveOutcome {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return RemoveOutcome::NotFound;
        };
        let Some(index) = subscribers.iter().position(|s| &s.id == id) else {
            return RemoveOutcome::NotFound;
        };
        let _ = subscribers.remove(index);
        if subscribers.is_empty() {
            let _ = self.channels.remove(channel);
            RemoveOutcome::RemovedLast
        } else {
            RemoveOutcome::Removed
        }
    }

    /// Snapshot of the handlers on `channel`, in registration order.
    ///
    /// Callers invoke the snapshot after releasing any lock on the registry,
    /// so handlers may subscribe or dispose re-entrantly.
    pub fn handlers(&self, channel: &str) -> Vec<ChannelHandler> {
        self.channels
            .get(channel)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
            .unwrap_or_default()
    }

    /// Channels with at least one live handler, sorted by name.
    pub fn active_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Number of handlers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, Vec::len)
    }

    /// Total handlers across all channels.
    pub fn len(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

/// Invoke each handler with `data`, isolating panics.
///
/// A panicking handler is logged and skipped; the remaining handlers still
/// run. Returns how many handlers completed normally.
pub fn invoke_handlers(channel: &str, handlers: &[ChannelHandler], data: &Value) -> usize {
    let mut delivered = 0;
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(data))) {
            Ok(()) => delivered += 1,
            Err(_) => {
                metrics::counter!("realtime_handler_panics_total").increment(1);
                error!(channel, "channel handler panicked");
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> ChannelHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &Value| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn first_and_last_are_reported() {
        let mut registry = ChannelRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let a = registry.add("memory_updates", counting(&hits));
        assert!(a.first_on_channel);
        let b = registry.add("memory_updates", counting(&hits));
        assert!(!b.first_on_channel);

        assert_eq!(registry.remove("memory_updates", &a.id), RemoveOutcome::Removed);
        assert_eq!(
            registry.remove("memory_updates", &b.id),
            RemoveOutcome::RemovedLast
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn double_remove_is_not_found() {
        let mut registry = ChannelRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = registry.add("c", counting(&hits));
        assert_eq!(registry.remove("c", &a.id), RemoveOutcome::RemovedLast);
        assert_eq!(registry.remove("c", &a.id), RemoveOutcome::NotFound);
        assert_eq!(registry.remove("other", &a.id), RemoveOutcome::NotFound);
    }

    #[test]
    fn handlers_preserve_registration_order() {
        let mut registry = ChannelRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            let _ = registry.add("c", Arc::new(move |_: &Value| order.lock().push(n)));
        }
        let handlers = registry.handlers("c");
        assert_eq!(invoke_handlers("c", &handlers, &json!({})), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let mut registry = ChannelRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let _ = registry.add("c", Arc::new(|_: &Value| panic!("handler bug")));
        let _ = registry.add("c", counting(&hits));

        let delivered = invoke_handlers("c", &registry.handlers("c"), &json!(1));
        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn active_channels_sorted() {
        let mut registry = ChannelRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let _ = registry.add("zeta", counting(&hits));
        let _ = registry.add("alpha", counting(&hits));
        let _ = registry.add("alpha", counting(&hits));
        assert_eq!(registry.active_channels(), vec!["alpha", "zeta"]);
        assert_eq!(registry.subscriber_count("alpha"), 2);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn unknown_channel_has_no_handlers() {
        let registry = ChannelRegistry::new();
        assert!(registry.handlers("nothing").is_empty());
        assert_eq!(registry.subscriber_count("nothing"), 0);
    }

    proptest! {
        // After any sequence of adds and removes, exactly the live
        // registrations are invoked.
        #[test]
        fn invoked_set_matches_live_registrations(
            ops in proptest::collection::vec((any::<bool>(), 0usize..8), 1..40)
        ) {
            let mut registry = ChannelRegistry::new();
            let hits: Vec<Arc<AtomicUsize>> =
                (0..8).map(|_| Arc::new(AtomicUsize::new(0))).collect();
            let mut live: Vec<Option<SubscriptionId>> = vec![None; 8];

            for (add, slot) in ops {
                if add {
                    if live[slot].is_none() {
                        live[slot] = Some(registry.add("c", counting(&hits[slot])).id);
                    }
                } else if let Some(id) = live[slot].take() {
                    let _ = registry.remove("c", &id);
                }
            }

            let _ = invoke_handlers("c", &registry.handlers("c"), &Value::Null);
            for (slot, id) in live.iter().enumerate() {
                let expected = usize::from(id.is_some());
                prop_assert_eq!(hits[slot].load(Ordering::SeqCst), expected);
            }
            prop_assert_eq!(
                registry.subscriber_count("c"),
                live.iter().filter(|id| id.is_some()).count()
            );
        }
    }
}
