//! # Tether Refs
//!
//! Host-authoritative values mirrored read-only into satellites.
//!
//! ```text
//!  Satellite                          Host
//!  RefMirror.write(k, v) ── RefWrite ──▶ RefStore.write
//!                                          │ validate, version += 1
//!                                          ▼
//!  RefMirror.apply  ◀── ref-changed{k, v, version} ── HostBus.publish
//! ```
//!
//! - A declared reference starts at version 1; each applied write adds 1.
//! - Writes to undeclared keys are rejected.
//! - Persisted references are rehydrated on declaration and saved after
//!   every applied change.
//! - Within one session a mirror never moves backwards: updates carrying a
//!   version at or below the mirrored one are ignored.
//! - Each new connection re-reads every mirrored key from the host.

pub mod mirror;
pub mod persist;
pub mod protocol;
pub mod store;

pub use mirror::RefMirror;
pub use protocol::{
    RefReadRequest, RefSnapshot, RefWriteRequest, RefWriteResponse, REF_READ_METHOD,
    REF_WRITE_METHOD,
};
pub use persist::{JsonFileStore, PersistError, PersistOptions, RefPersistence};
pub use store::{RefError, RefOptions, RefStore, Validator};
