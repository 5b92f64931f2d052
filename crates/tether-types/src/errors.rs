//! # Error Types
//!
//! Two layers of failure:
//!
//! - [`WireError`]: what a host handler failure looks like on the wire, inside
//!   a `response` envelope.
//! - [`LinkError`]: what a local caller receives. Every RPC and reference
//!   operation resolves to `Result<_, LinkError>`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure classes carried in the `error.kind` field of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The handler returned an error or panicked.
    Handler,
    /// No handler is registered under the requested method name.
    MethodNotFound,
    /// The request payload did not match what the handler expects.
    InvalidParams,
    /// The handler exceeded the host's handler deadline.
    Timeout,
    /// The handler result could not be encoded.
    Serialization,
}

impl ErrorKind {
    /// Wire spelling of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::MethodNotFound => "method_not_found",
            Self::InvalidParams => "invalid_params",
            Self::Timeout => "timeout",
            Self::Serialization => "serialization",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure detail embedded in a `response` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Generic handler failure carrying the original detail.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorKind::MethodNotFound, format!("no handler for method {method}"))
    }
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, e.to_string())
    }
}

/// Errors surfaced to local callers of the link.
///
/// Cloneable so a single in-flight outcome (connection bootstrap) can be
/// handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The channel is unavailable or was closed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response arrived before the call deadline.
    #[error("call to {method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The host handler failed; carries the original failure detail.
    #[error("remote handler for {method} failed ({kind}): {message}")]
    RemoteHandler {
        method: String,
        kind: ErrorKind,
        message: String,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The connection handshake failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The caller abandoned the call before it resolved.
    #[error("call to {method} was cancelled")]
    Cancelled { method: String },
}

impl LinkError {
    /// Lift a wire failure into a caller-facing error for `method`.
    pub fn remote(method: &str, error: WireError) -> Self {
        Self::RemoteHandler {
            method: method.to_string(),
            kind: error.kind,
            message: error.message,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The remote failure class, if this error came from a host handler.
    pub fn remote_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::RemoteHandler { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
