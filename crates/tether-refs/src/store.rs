//! # Reference Store
//!
//! Host-side owner of every synchronized reference. Writes are serialized by
//! one store lock; the `ref-changed` broadcast happens before the lock is
//! released, so satellites observe versions in increasing order.
//!
//! Host-local `ref-changed` subscribers run while the store is locked and
//! must not call back into the store.
//!
//! A reference declared with [`PersistOptions`] starts from its stored value
//! when one exists and passes validation, and is saved after every applied
//! change. Save failures are logged; the change still applies.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tether_bus::HostBus;
use tether_rpc::{typed_handler, HandlerError, MethodRegistry, RegistryError};
use tether_telemetry::{metric_inc, REF_WRITES};
use tether_types::{RefChanged, RefChangedPayload};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::persist::PersistOptions;
use crate::protocol::{
    RefReadRequest, RefSnapshot, RefWriteRequest, RefWriteResponse, REF_READ_METHOD,
    REF_WRITE_METHOD,
};

/// Accepts or rejects a candidate value.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Reference store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefError {
    #[error("unknown reference {0}")]
    UnknownRef(String),

    #[error("reference {0} is already declared")]
    AlreadyDeclared(String),

    #[error("reference key must not be empty")]
    EmptyKey,

    #[error("rejected value for {key}: {reason}")]
    Validation { key: String, reason: String },
}

impl From<RefError> for HandlerError {
    fn from(e: RefError) -> Self {
        match e {
            RefError::Validation { .. } => HandlerError::InvalidParams(e.to_string()),
            other => HandlerError::Failed(other.to_string()),
        }
    }
}

/// Per-reference behaviour chosen at declaration.
#[derive(Clone, Default)]
pub struct RefOptions {
    pub validator: Option<Validator>,
    pub persist: Option<PersistOptions>,
}

struct Persisted {
    options: PersistOptions,
    storage_key: String,
}

impl Persisted {
    fn save(&self, ref_key: &str, value: &Value) {
        if let Err(e) = self.options.backend.save(&self.storage_key, value) {
            warn!(ref_key, storage_key = %self.storage_key, error = %e, "Failed to persist reference");
        }
    }
}

struct RefEntry {
    value: Value,
    version: u64,
    validator: Option<Validator>,
    persisted: Option<Persisted>,
}

impl RefEntry {
    fn snapshot(&self) -> RefSnapshot {
        RefSnapshot {
            value: self.value.clone(),
            version: self.version,
        }
    }
}

pub struct RefStore {
    bus: HostBus,
    entries: Mutex<HashMap<String, RefEntry>>,
}

impl RefStore {
    pub fn new(bus: HostBus) -> Self {
        Self {
            bus,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Declare `key` with an initial value at version 1.
    pub fn declare(&self, key: impl Into<String>, initial: Value) -> Result<RefSnapshot, RefError> {
        self.declare_with(key, initial, RefOptions::default())
    }

    /// Declare `key` with a validator that every later write must pass. The
    /// initial value is checked too.
    pub fn declare_with_validator(
        &self,
        key: impl Into<String>,
        initial: Value,
        validator: Validator,
    ) -> Result<RefSnapshot, RefError> {
        self.declare_with(
            key,
            initial,
            RefOptions {
                validator: Some(validator),
                persist: None,
            },
        )
    }

    /// Declare `key` backed by `persist`. A stored value replaces `initial`
    /// when it passes the validator; otherwise `initial` is used and saved.
    pub fn declare_persisted(
        &self,
        key: impl Into<String>,
        initial: Value,
        persist: PersistOptions,
    ) -> Result<RefSnapshot, RefError> {
        self.declare_with(
            key,
            initial,
            RefOptions {
                validator: None,
                persist: Some(persist),
            },
        )
    }

    /// Declare `key` with any combination of options.
    pub fn declare_with(
        &self,
        key: impl Into<String>,
        initial: Value,
        options: RefOptions,
    ) -> Result<RefSnapshot, RefError> {
        let key = key.into();
        if key.is_empty() {
            return Err(RefError::EmptyKey);
        }
        let RefOptions { validator, persist } = options;
        if let Some(validator) = &validator {
            validator(&initial).map_err(|reason| RefError::Validation {
                key: key.clone(),
                reason,
            })?;
        }
        if self.entries.lock().contains_key(&key) {
            return Err(RefError::AlreadyDeclared(key));
        }

        let persisted = persist.map(|options| Persisted {
            storage_key: options.resolve_key(&key),
            options,
        });
        let start = match &persisted {
            Some(persisted) => rehydrate(&key, persisted, validator.as_ref(), initial),
            None => initial,
        };

        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(RefError::AlreadyDeclared(key));
        }
        if let Some(persisted) = &persisted {
            persisted.save(&key, &start);
        }
        let entry = RefEntry {
            value: start,
            version: 1,
            validator,
            persisted,
        };
        let snapshot = entry.snapshot();
        entries.insert(key.clone(), entry);
        self.broadcast(&key, &snapshot);

        info!(ref_key = %key, "Declared reference");
        Ok(snapshot)
    }

    /// Validate and apply `value`, returning the new version.
    pub fn write(&self, key: &str, value: Value) -> Result<u64, RefError> {
        self.update(key, |_| value)
    }

    /// Read-modify-write under the store lock: `f` sees the current value
    /// and its result is validated and applied like a write. Returns the new
    /// version.
    pub fn update<F>(&self, key: &str, f: F) -> Result<u64, RefError>
    where
        F: FnOnce(&Value) -> Value,
    {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            metric_inc!(REF_WRITES, &["rejected"]);
            return Err(RefError::UnknownRef(key.to_string()));
        };

        let value = f(&entry.value);
        if let Some(validator) = &entry.validator {
            if let Err(reason) = validator(&value) {
                warn!(ref_key = key, reason = %reason, "Reference write rejected");
                metric_inc!(REF_WRITES, &["rejected"]);
                return Err(RefError::Validation {
                    key: key.to_string(),
                    reason,
                });
            }
        }

        entry.value = value;
        entry.version += 1;
        if let Some(persisted) = &entry.persisted {
            persisted.save(key, &entry.value);
        }
        let snapshot = entry.snapshot();
        self.broadcast(key, &snapshot);

        metric_inc!(REF_WRITES, &["applied"]);
        debug!(ref_key = key, version = snapshot.version, "Reference written");
        Ok(snapshot.version)
    }

    fn broadcast(&self, key: &str, snapshot: &RefSnapshot) {
        let payload = RefChangedPayload {
            ref_key: key.to_string(),
            value: snapshot.value.clone(),
            version: snapshot.version,
        };
        if let Err(e) = self.bus.publish_to::<RefChanged>(&payload) {
            warn!(ref_key = key, error = %e, "Failed to broadcast reference change");
        }
    }

    pub fn read(&self, key: &str) -> Option<RefSnapshot> {
        self.entries.lock().get(key).map(RefEntry::snapshot)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Expose `RefWrite` and `RefRead` on the host registry. Both are
    /// ordered, so one satellite's writes apply in the order it sent them and
    /// a read sees every earlier write from the same channel.
    pub fn register_methods(self: &Arc<Self>, registry: &MethodRegistry) -> Result<(), RegistryError> {
        let store = self.clone();
        registry.register_ordered(
            REF_WRITE_METHOD,
            typed_handler(move |request: RefWriteRequest| {
                let store = store.clone();
                async move {
                    let version = store.write(&request.key, request.value)?;
                    Ok::<_, HandlerError>(RefWriteResponse { version })
                }
            }),
        )?;

        let store = self.clone();
        registry.register_ordered(
            REF_READ_METHOD,
            typed_handler(move |request: RefReadRequest| {
                let store = store.clone();
                async move {
                    store
                        .read(&request.key)
                        .ok_or_else(|| HandlerError::from(RefError::UnknownRef(request.key)))
                }
            }),
        )
    }
}

/// Starting value for a persisted reference.
fn rehydrate(key: &str, persisted: &Persisted, validator: Option<&Validator>, initial: Value) -> Value {
    let stored = match persisted.options.backend.load(&persisted.storage_key) {
        Ok(Some(stored)) => stored,
        Ok(None) => return initial,
        Err(e) => {
            warn!(ref_key = key, error = %e, "Failed to load persisted reference, using initial value");
            return initial;
        }
    };

    match validator.map_or(Ok(()), |validate| validate(&stored)) {
        Ok(()) => {
            info!(ref_key = key, storage_key = %persisted.storage_key, "Rehydrated reference");
            stored
        }
        Err(reason) => {
            warn!(ref_key = key, reason = %reason, "Stored value rejected, using initial value");
            initial
        }
    }
}
