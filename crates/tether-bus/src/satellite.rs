//! Satellite side of the bus.
//!
//! A local [`SubscriptionRegistry`] fed by the current connection's
//! transport. Satellites receive every event the host broadcasts and filter
//! by topic locally.

use parking_lot::Mutex;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tether_telemetry::{metric_inc, EVENTS_PUBLISHED};
use tether_transport::{ListenerId, Transport};
use tether_types::{topic_label, Envelope, LinkError, Topic};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::debug;

use crate::registry::{EventHandler, Subscription, SubscriptionRegistry};

struct Attachment {
    transport: Arc<dyn Transport>,
    listener: ListenerId,
}

#[derive(Default)]
struct Inner {
    registry: SubscriptionRegistry,
    attached: Mutex<Option<Attachment>>,
}

/// Cloneable handle; clones share subscriptions and the attachment.
#[derive(Clone, Default)]
pub struct SatelliteBus {
    inner: Arc<Inner>,
}

impl SatelliteBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed events from `transport` into the local registry, replacing any
    /// previous attachment. Subscriptions survive reattachment.
    pub fn attach(&self, transport: Arc<dyn Transport>) {
        let registry = self.inner.registry.clone();
        let listener = transport.on_message(Arc::new(move |envelope: &Envelope| {
            if let Envelope::Event { topic, payload } = envelope {
                registry.dispatch(topic, payload);
            }
        }));

        let previous = self.inner.attached.lock().replace(Attachment {
            transport,
            listener,
        });
        if let Some(previous) = previous {
            previous.transport.remove_listener(previous.listener);
        }
        debug!("Satellite bus attached");
    }

    pub fn detach(&self) {
        if let Some(previous) = self.inner.attached.lock().take() {
            previous.transport.remove_listener(previous.listener);
            debug!("Satellite bus detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .attached
            .lock()
            .as_ref()
            .is_some_and(|a| !a.transport.is_closed())
    }

    pub fn subscribe(&self, topic: impl Into<String>, handler: EventHandler) -> Subscription {
        self.inner.registry.subscribe(topic, handler)
    }

    /// Subscribe with a typed payload. Payloads that do not decode are
    /// logged and skipped.
    pub fn subscribe_to<T, F>(&self, handler: F) -> Subscription
    where
        T: Topic,
        F: Fn(T::Payload) + Send + Sync + 'static,
    {
        self.inner
            .registry
            .subscribe(T::NAME, crate::typed::<T, F>(T::NAME, handler))
    }

    /// Events on `topic` as an async stream. The stream ends on teardown.
    pub fn stream(&self, topic: impl Into<String>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.inner.registry.subscribe(
            topic,
            Arc::new(move |payload: &Value| {
                let _ = tx.send(payload.clone());
            }),
        );
        EventStream {
            receiver: rx,
            subscription,
        }
    }

    /// Send an event toward the host. Host-local subscribers receive it.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<(), LinkError> {
        let transport = match self.inner.attached.lock().as_ref() {
            Some(a) => a.transport.clone(),
            None => return Err(LinkError::Transport("satellite bus is not attached".into())),
        };
        transport.send(Envelope::event(topic, payload))?;
        metric_inc!(EVENTS_PUBLISHED, &[topic_label(topic)]);
        Ok(())
    }

    pub fn publish_to<T: Topic>(&self, payload: &T::Payload) -> Result<(), LinkError> {
        let value = serde_json::to_value(payload)?;
        self.publish(T::NAME, value)
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Dispose every subscription and detach from the transport.
    pub fn teardown(&self) -> usize {
        self.detach();
        let removed = self.inner.registry.clear();
        debug!(removed, "Satellite bus torn down");
        removed
    }
}

/// Async stream of payloads for one topic.
///
/// Implements `tokio_stream::Stream` for use with stream combinators.
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Value>,
    subscription: Subscription,
}

impl EventStream {
    /// Next payload, or `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }
}

impl Stream for EventStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
