//! # Reference Mirror
//!
//! Satellite-side read-only copy of host references. The mirror changes only
//! when a `ref-changed` event (or a `refresh`) carries a version newer than
//! the one held; writes go to the host and come back as events.
//!
//! Every new connection re-reads each mirrored key from the host, so changes
//! made while the satellite was away are picked up. When the session differs
//! from the previous one, held versions no longer bound what is accepted: the
//! first snapshot seen for a key on the new session replaces the old one even
//! if its version is lower, which covers a restarted host counting from 1
//! again.

use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tether_bus::{SatelliteBus, Subscription};
use tether_rpc::{CallOptions, Connection, ConnectionManager, SessionInfo};
use tether_types::{LinkError, RefChanged, RefChangedPayload};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::protocol::{
    RefReadRequest, RefSnapshot, RefWriteRequest, RefWriteResponse, REF_READ_METHOD,
    REF_WRITE_METHOD,
};

type Slot = watch::Sender<Option<RefSnapshot>>;

struct MirrorInner {
    connections: ConnectionManager,
    slots: RwLock<HashMap<String, Slot>>,
    /// Keys whose held version belongs to an earlier session.
    stale: Mutex<HashSet<String>>,
    session: Mutex<Option<SessionInfo>>,
    subscription: Mutex<Option<Subscription>>,
}

impl MirrorInner {
    fn slot(&self, key: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .clone()
    }

    /// Apply `snapshot` if it is newer than the mirrored one, or if the
    /// mirrored one is left over from an earlier session.
    fn apply(&self, key: &str, snapshot: RefSnapshot) -> bool {
        let version = snapshot.version;
        let applied = self.slot(key).send_if_modified(|current| {
            let mut stale = self.stale.lock();
            if stale.remove(key) {
                if current.as_ref() == Some(&snapshot) {
                    return false;
                }
            } else if current.as_ref().is_some_and(|c| c.version >= version) {
                return false;
            }
            *current = Some(snapshot);
            true
        });
        if applied {
            debug!(ref_key = key, version, "Mirrored reference update");
        } else {
            debug!(ref_key = key, version, "Ignored stale reference update");
        }
        applied
    }

    /// Runs for every new connection before callers see it.
    fn on_connect(self: &Arc<Self>, conn: &Connection) {
        if self.subscription.lock().is_none() {
            return;
        }
        let keys: Vec<String> = self.slots.read().keys().cloned().collect();
        let session = conn.session().clone();
        let previous = self.session.lock().replace(session.clone());
        if previous.is_some_and(|p| p.session_id != session.session_id) {
            self.stale.lock().extend(keys.iter().cloned());
        }
        if keys.is_empty() {
            return;
        }

        info!(session_id = %session.session_id, keys = keys.len(), "Re-reading mirrored references");
        let mirror = RefMirror {
            inner: self.clone(),
        };
        tokio::spawn(async move {
            for key in keys {
                if let Err(e) = mirror.refresh(&key).await {
                    debug!(ref_key = %key, error = %e, "Could not re-read reference");
                }
            }
        });
    }
}

/// Cloneable handle; clones share one mirror.
#[derive(Clone)]
pub struct RefMirror {
    inner: Arc<MirrorInner>,
}

impl RefMirror {
    /// Start mirroring `ref-changed` events arriving on `bus`. Every key the
    /// mirror knows about is re-read from the host on each new connection.
    ///
    /// `bus` should already be attached to new connections by an earlier
    /// `on_connect` hook, so no event is missed between the re-read and the
    /// first update.
    pub fn new(bus: &SatelliteBus, connections: ConnectionManager) -> Self {
        let inner = Arc::new(MirrorInner {
            connections: connections.clone(),
            slots: RwLock::new(HashMap::new()),
            stale: Mutex::new(HashSet::new()),
            session: Mutex::new(None),
            subscription: Mutex::new(None),
        });

        let hook_target: Weak<MirrorInner> = Arc::downgrade(&inner);
        connections.on_connect(Arc::new(move |conn: &Connection| {
            if let Some(inner) = hook_target.upgrade() {
                inner.on_connect(conn);
            }
        }));

        let weak: Weak<MirrorInner> = Arc::downgrade(&inner);
        let subscription = bus.subscribe_to::<RefChanged, _>(move |p: RefChangedPayload| {
            if let Some(inner) = weak.upgrade() {
                inner.apply(
                    &p.ref_key,
                    RefSnapshot {
                        value: p.value,
                        version: p.version,
                    },
                );
            }
        });
        *inner.subscription.lock() = Some(subscription);

        Self { inner }
    }

    /// Last mirrored snapshot, if any update has arrived.
    pub fn read(&self, key: &str) -> Option<RefSnapshot> {
        self.inner
            .slots
            .read()
            .get(key)
            .and_then(|slot| slot.borrow().clone())
    }

    /// Mirrored value decoded as `T`.
    pub fn read_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, LinkError> {
        match self.read(key) {
            Some(snapshot) => Ok(Some(serde_json::from_value(snapshot.value)?)),
            None => Ok(None),
        }
    }

    /// Ask the host to write `value`. Returns the version the host assigned.
    /// The mirror itself updates when the change event arrives.
    pub async fn write(&self, key: &str, value: Value) -> Result<u64, LinkError> {
        let conn = self.inner.connections.ensure_connection().await?;
        let response: RefWriteResponse = conn
            .client()
            .call_typed(
                REF_WRITE_METHOD,
                &RefWriteRequest {
                    key: key.to_string(),
                    value,
                },
                CallOptions::default(),
            )
            .await?;
        Ok(response.version)
    }

    pub async fn write_as<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<u64, LinkError> {
        self.write(key, serde_json::to_value(value)?).await
    }

    /// Fetch the host's current snapshot and seed the mirror with it.
    pub async fn refresh(&self, key: &str) -> Result<RefSnapshot, LinkError> {
        let conn = self.inner.connections.ensure_connection().await?;
        let snapshot: RefSnapshot = conn
            .client()
            .call_typed(
                REF_READ_METHOD,
                &RefReadRequest {
                    key: key.to_string(),
                },
                CallOptions::default(),
            )
            .await?;
        self.inner.apply(key, snapshot.clone());
        Ok(snapshot)
    }

    /// Observe mirrored updates for `key`. Starts at the current snapshot.
    pub fn watch(&self, key: &str) -> watch::Receiver<Option<RefSnapshot>> {
        self.inner.slot(key).subscribe()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.borrow().is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Stop following `ref-changed` and stop re-reading on reconnect.
    /// Mirrored snapshots stay readable.
    pub fn detach(&self) {
        self.inner.subscription.lock().take();
    }
}
