//! # Tether Bus
//!
//! Topic-based publish/subscribe riding on the same channel as RPC.
//!
//! ## Architecture
//!
//! ```text
//!                       HostBus.publish(topic, payload)
//!                                  │
//!           ┌──────────────────────┼──────────────────────┐
//!           ▼                      ▼                      ▼
//!   host-local registry     event ─▶ peer 1          event ─▶ peer N
//!                                  │                      │
//!                                  ▼                      ▼
//!                           SatelliteBus            SatelliteBus
//!                           registry.dispatch       registry.dispatch
//! ```
//!
//! ## Delivery
//!
//! - Best-effort and live-only: a subscriber sees only events published
//!   after it subscribed. Nothing is stored or replayed.
//! - Per channel, events arrive in publish order. There is no ordering
//!   across topics or channels.
//! - Every subscription is a disposer; teardown disposes them all.

pub mod host;
pub mod registry;
pub mod satellite;

pub use host::{Delivery, HostBus};
pub use registry::{EventHandler, HandlerId, Subscription, SubscriptionRegistry};
pub use satellite::{EventStream, SatelliteBus};

use serde_json::Value;
use std::sync::Arc;
use tether_types::Topic;
use tracing::warn;

/// Wrap a typed handler into a raw one that decodes the payload first.
pub(crate) fn typed<T, F>(topic: &'static str, handler: F) -> EventHandler
where
    T: Topic,
    F: Fn(T::Payload) + Send + Sync + 'static,
{
    Arc::new(move |payload: &Value| {
        match serde_json::from_value::<T::Payload>(payload.clone()) {
            Ok(decoded) => handler(decoded),
            Err(e) => warn!(topic, error = %e, "Dropping event with undecodable payload"),
        }
    })
}
