//! # Tether RPC
//!
//! Typed request/response over a [`Transport`](tether_transport::Transport).
//!
//! ## Architecture
//!
//! ```text
//! Satellite                                         Host
//! ┌────────────────────────┐                 ┌────────────────────────┐
//! │ QueryProxy / RefMirror │                 │ MethodRegistry         │
//! │          │             │                 │  ├─ $handshake         │
//! │ ConnectionManager      │   request(id)   │  ├─ ExecuteQuery       │
//! │  (single-flight)       │ ──────────────▶ │  └─ RefWrite / RefRead │
//! │          │             │                 │          │             │
//! │ RpcClient              │  response(id)   │ RpcServer (task/req,   │
//! │  (pending-call table)  │ ◀────────────── │  panic-isolated)       │
//! └────────────────────────┘                 └────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - Every call resolves exactly once: response, timeout, cancellation or
//!   channel close, whichever comes first.
//! - Every request the host receives gets exactly one response.
//! - Concurrent `ensure_connection()` callers share one handshake.

pub mod cancel;
pub mod client;
pub mod connection;
pub mod handshake;
pub mod pending;
pub mod query;
pub mod server;

pub use cancel::CancelToken;
pub use client::{CallOptions, RpcClient};
pub use connection::{
    ConnectHook, Connection, ConnectionManager, ConnectionState, Connector, OnceConnector,
    SessionInfo,
};
pub use handshake::{HandshakeRequest, HandshakeResponse, HANDSHAKE_METHOD};
pub use query::{register_query_handler, QueryError, QueryExecutor, QueryProxy};
pub use server::{
    handler_fn, typed_handler, HandlerError, MethodHandler, MethodRegistry, RegistryError,
    RpcServer, ServeHandle,
};

use std::time::Duration;

/// Default deadline for an outbound call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for the `$handshake` round trip.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeouts for both sides of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    /// Deadline for calls that do not set their own
    pub call_timeout: Duration,
    /// Deadline for the connection handshake
    pub handshake_timeout: Duration,
    /// Host-side limit on handler run time; `None` lets handlers run until
    /// the caller gives up
    pub handler_timeout: Option<Duration>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handler_timeout: None,
        }
    }
}
