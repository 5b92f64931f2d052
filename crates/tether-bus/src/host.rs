//! Host side of the bus.
//!
//! Keeps the set of attached satellite channels. A publish sends one `event`
//! envelope down every open channel and dispatches to host-local
//! subscribers. Events a satellite publishes toward the host reach host-local
//! subscribers only; they are not relayed to other satellites.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_telemetry::{metric_inc, EVENTS_PUBLISHED};
use tether_transport::{ListenerId, Transport};
use tether_types::{topic_label, Envelope, LinkError, PeerId, Topic};
use tracing::{debug, warn};

use crate::registry::{EventHandler, Subscription, SubscriptionRegistry};

struct Peer {
    transport: Arc<dyn Transport>,
    listener: ListenerId,
}

/// Where one publish ended up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Satellite channels the event was queued on
    pub peers: usize,
    /// Host-local handlers invoked
    pub local: usize,
}

#[derive(Clone, Default)]
pub struct HostBus {
    local: SubscriptionRegistry,
    peers: Arc<RwLock<BTreeMap<PeerId, Peer>>>,
}

impl HostBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start broadcasting to `transport` and accept its inbound events.
    pub fn attach_peer(&self, peer: PeerId, transport: Arc<dyn Transport>) {
        let local = self.local.clone();
        let listener = transport.on_message(Arc::new(move |envelope: &Envelope| {
            if let Envelope::Event { topic, payload } = envelope {
                debug!(%peer, topic = %topic, "Event from satellite");
                local.dispatch(topic, payload);
            }
        }));

        let previous = self.peers.write().insert(
            peer,
            Peer {
                transport,
                listener,
            },
        );
        if let Some(previous) = previous {
            previous.transport.remove_listener(previous.listener);
        }
        debug!(%peer, "Peer attached to bus");
    }

    /// Stop broadcasting to `peer`. Returns false if it was not attached.
    pub fn detach_peer(&self, peer: PeerId) -> bool {
        match self.peers.write().remove(&peer) {
            Some(entry) => {
                entry.transport.remove_listener(entry.listener);
                debug!(%peer, "Peer detached from bus");
                true
            }
            None => false,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    /// Broadcast `payload` on `topic` to every satellite and local
    /// subscriber. Closed channels are pruned.
    pub fn publish(&self, topic: &str, payload: Value) -> Delivery {
        let envelope = Envelope::event(topic, payload);
        let mut delivery = Delivery::default();
        let mut closed = Vec::new();

        {
            let peers = self.peers.read();
            for (peer, entry) in peers.iter() {
                match entry.transport.send(envelope.clone()) {
                    Ok(()) => delivery.peers += 1,
                    Err(LinkError::Transport(_)) => closed.push(*peer),
                    Err(e) => warn!(%peer, topic, error = %e, "Failed to publish event"),
                }
            }
        }

        for peer in closed {
            debug!(%peer, "Pruning closed peer");
            self.detach_peer(peer);
        }

        delivery.local = self.local.dispatch(topic, envelope.payload());
        metric_inc!(EVENTS_PUBLISHED, &[topic_label(topic)]);
        debug!(topic, peers = delivery.peers, local = delivery.local, "Published event");
        delivery
    }

    /// Publish a typed payload on `T`'s topic.
    pub fn publish_to<T: Topic>(&self, payload: &T::Payload) -> Result<Delivery, LinkError> {
        let value = serde_json::to_value(payload)?;
        Ok(self.publish(T::NAME, value))
    }

    /// Subscribe a host-local handler.
    pub fn subscribe(&self, topic: impl Into<String>, handler: EventHandler) -> Subscription {
        self.local.subscribe(topic, handler)
    }

    /// Subscribe a host-local handler with a typed payload. Payloads that do
    /// not decode are logged and skipped.
    pub fn subscribe_to<T, F>(&self, handler: F) -> Subscription
    where
        T: Topic,
        F: Fn(T::Payload) + Send + Sync + 'static,
    {
        self.local.subscribe(T::NAME, crate::typed::<T, F>(T::NAME, handler))
    }

    pub fn local(&self) -> &SubscriptionRegistry {
        &self.local
    }

    /// Detach every peer and drop every local subscription.
    pub fn clear(&self) {
        let peers: Vec<PeerId> = self.peer_ids();
        for peer in peers {
            self.detach_peer(peer);
        }
        self.local.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;
    use tether_transport::memory_pair;
    use tether_types::{TaskStart, TaskStartPayload};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn events(transport: &Arc<dyn Transport>) -> mpsc::UnboundedReceiver<(String, Value)> {
        let (tx, rx) = mpsc::unbounded_channel();
        transport.on_message(Arc::new(move |env: &Envelope| {
            if let Envelope::Event { topic, payload } = env {
                let _ = tx.send((topic.clone(), payload.clone()));
            }
        }));
        rx
    }

    fn peer_pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        let (host, satellite) = memory_pair();
        (host, satellite)
    }

    #[tokio::test]
    async fn test_publish_reaches_every_peer_and_local() {
        let bus = HostBus::new();
        let (h1, s1) = peer_pair();
        let (h2, s2) = peer_pair();
        bus.attach_peer(PeerId(1), h1);
        bus.attach_peer(PeerId(2), h2);
        let mut rx1 = events(&s1);
        let mut rx2 = events(&s2);

        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let _sub = bus.subscribe("invalidate-query", Arc::new(move |_: &Value| *counter.lock() += 1));

        let delivery = bus.publish("invalidate-query", json!("tasks"));
        assert_eq!(delivery, Delivery { peers: 2, local: 1 });

        for rx in [&mut rx1, &mut rx2] {
            let (topic, payload) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert_eq!(topic, "invalidate-query");
            assert_eq!(payload, json!("tasks"));
        }
        assert_eq!(*seen.lock(), 1);
    }

    #[tokio::test]
    async fn test_closed_peer_is_pruned() {
        let bus = HostBus::new();
        let (h1, s1) = peer_pair();
        bus.attach_peer(PeerId(1), h1.clone());
        s1.close();
        timeout(Duration::from_secs(1), h1.closed()).await.unwrap();

        let delivery = bus.publish("t", json!(null));
        assert_eq!(delivery.peers, 0);
        assert_eq!(bus.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_satellite_events_reach_host_subscribers_only() {
        let bus = HostBus::new();
        let (h1, s1) = peer_pair();
        let (h2, s2) = peer_pair();
        bus.attach_peer(PeerId(1), h1);
        bus.attach_peer(PeerId(2), h2);
        let mut rx2 = events(&s2);

        let (tx, mut started) = mpsc::unbounded_channel();
        let _sub = bus.subscribe_to::<TaskStart, _>(move |p: TaskStartPayload| {
            let _ = tx.send(p.task_id);
        });

        s1.send(Envelope::event("task-start", json!({"taskId": "t-9"})))
            .unwrap();
        let task = timeout(Duration::from_secs(1), started.recv()).await.unwrap().unwrap();
        assert_eq!(task, "t-9");

        // Not relayed to the other satellite.
        assert!(timeout(Duration::from_millis(50), rx2.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_detach_peer() {
        let bus = HostBus::new();
        let (h1, s1) = peer_pair();
        bus.attach_peer(PeerId(1), h1);
        let mut rx = events(&s1);

        assert!(bus.detach_peer(PeerId(1)));
        assert!(!bus.detach_peer(PeerId(1)));
        bus.publish("t", json!(1));
        assert!(timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }
}
