//! # Subscription Registry
//!
//! Topic → handlers table used on both sides of the link.
//!
//! - `subscribe` returns a [`Subscription`] disposer. Disposing it (or
//!   dropping it) removes the handler.
//! - `dispatch` snapshots the handlers for the topic first, so a handler
//!   added during dispatch does not see the event and one removed during
//!   dispatch still does. Each handler in the snapshot runs exactly once.
//! - A panicking handler is logged and does not affect the others.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_telemetry::EVENTS_DELIVERED;
use tether_types::topic_label;
use tracing::{debug, error};

/// Callback for events on one topic.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one handler within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct RegistryInner {
    topics: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn remove(&self, topic: &str, id: HandlerId) -> bool {
        let mut topics = self.topics.write();
        let Some(handlers) = topics.get_mut(topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

/// Cloneable handle; clones share one table.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`.
    pub fn subscribe(&self, topic: impl Into<String>, handler: EventHandler) -> Subscription {
        let topic = topic.into();
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .topics
            .write()
            .entry(topic.clone())
            .or_default()
            .push((id, handler));

        debug!(topic = %topic, handler_id = id.0, "Subscribed");
        Subscription {
            topic,
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Invoke every handler currently subscribed to `topic`. Returns the
    /// number of handlers that ran to completion.
    pub fn dispatch(&self, topic: &str, payload: &Value) -> usize {
        let snapshot: Vec<(HandlerId, EventHandler)> = match self.inner.topics.read().get(topic) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    error!(topic, handler_id = id.0, "Event handler panicked");
                }
            }
        }

        if delivered > 0 {
            EVENTS_DELIVERED
                .with_label_values(&[topic_label(topic)])
                .inc_by(delivered as u64);
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.read().get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one handler.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Remove every handler. Outstanding [`Subscription`]s become inert.
    pub fn clear(&self) -> usize {
        let mut topics = self.inner.topics.write();
        let removed = topics.values().map(Vec::len).sum();
        topics.clear();
        debug!(removed, "Cleared subscriptions");
        removed
    }
}

/// Disposer for one handler registration.
///
/// Dropping it unsubscribes; keep it alive for as long as events are wanted.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    topic: String,
    id: HandlerId,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Whether the handler is still registered.
    pub fn is_active(&self) -> bool {
        self.registry.upgrade().is_some_and(|inner| {
            inner
                .topics
                .read()
                .get(&self.topic)
                .is_some_and(|handlers| handlers.iter().any(|(id, _)| *id == self.id))
        })
    }

    /// Unsubscribe now.
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            if inner.remove(&self.topic, self.id) {
                debug!(topic = %self.topic, handler_id = self.id.0, "Subscription disposed");
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}
