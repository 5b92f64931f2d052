//! # Envelope
//!
//! The single message unit exchanged over a transport. One physical channel
//! multiplexes RPC, pub/sub and reference sync; the variant is the routing
//! key.
//!
//! - `Request`/`Response` pairs share a [`CallId`]. Every request produces
//!   exactly one response with the same id, or the caller times out.
//! - `Event` carries only a topic; there is nothing to correlate.

use crate::errors::WireError;
use crate::id::CallId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The explicit discriminant carried in the `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
    Event,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated message. Construct through the helpers; decode through
/// [`crate::codec::decode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: CallId,
        method: String,
        payload: Value,
    },
    Response {
        id: CallId,
        payload: Value,
        error: Option<WireError>,
    },
    Event {
        topic: String,
        payload: Value,
    },
}

impl Envelope {
    pub fn request(id: CallId, method: impl Into<String>, payload: Value) -> Self {
        Self::Request {
            id,
            method: method.into(),
            payload,
        }
    }

    /// Successful response for `id`.
    pub fn success(id: CallId, payload: Value) -> Self {
        Self::Response {
            id,
            payload,
            error: None,
        }
    }

    /// Failed response for `id`. The payload is `null`.
    pub fn failure(id: CallId, error: WireError) -> Self {
        Self::Response {
            id,
            payload: Value::Null,
            error: Some(error),
        }
    }

    pub fn event(topic: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            topic: topic.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Request { .. } => EnvelopeKind::Request,
            Self::Response { .. } => EnvelopeKind::Response,
            Self::Event { .. } => EnvelopeKind::Event,
        }
    }

    /// Correlation id, absent for events.
    pub fn id(&self) -> Option<CallId> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(*id),
            Self::Event { .. } => None,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Event { topic, .. } => Some(topic),
            _ => None,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Request { payload, .. }
            | Self::Response { payload, .. }
            | Self::Event { payload, .. } => payload,
        }
    }
}
