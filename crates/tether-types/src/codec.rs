//! # Envelope Codec
//!
//! JSON encoding of [`Envelope`] with decode-time validation of the `kind`
//! discriminant. Anything that does not match one of the three shapes below
//! is rejected before it can reach a listener.
//!
//! | kind       | required          | forbidden                |
//! |------------|-------------------|--------------------------|
//! | `request`  | `id`, `method`    | `topic`, `error`         |
//! | `response` | `id`              | `method`, `topic`        |
//! | `event`    | `topic`           | `id`, `method`, `error`  |
//!
//! `payload` defaults to `null` when absent.

use crate::envelope::{Envelope, EnvelopeKind};
use crate::errors::{LinkError, WireError};
use crate::id::CallId;
use crate::MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reasons an envelope could not be encoded or decoded.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unknown envelope kind: {0}")]
    UnknownKind(String),

    #[error("malformed {kind} envelope: {reason}")]
    Malformed { kind: EnvelopeKind, reason: String },

    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },
}

impl From<CodecError> for LinkError {
    fn from(e: CodecError) -> Self {
        LinkError::Serialization(e.to_string())
    }
}

/// Everything the wire may carry, before validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<String>,
    kind: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Serialize)]
struct RawEnvelopeRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<CallId>,
    kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    payload: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a WireError>,
}

/// Encode an envelope to its wire bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let raw = match envelope {
        Envelope::Request {
            id,
            method,
            payload,
        } => {
            if method.is_empty() {
                return Err(malformed(EnvelopeKind::Request, "method must not be empty"));
            }
            RawEnvelopeRef {
                id: Some(*id),
                kind: EnvelopeKind::Request,
                method: Some(method.as_str()),
                topic: None,
                payload,
                error: None,
            }
        }
        Envelope::Response { id, payload, error } => RawEnvelopeRef {
            id: Some(*id),
            kind: EnvelopeKind::Response,
            method: None,
            topic: None,
            payload,
            error: error.as_ref(),
        },
        Envelope::Event { topic, payload } => {
            if topic.is_empty() {
                return Err(malformed(EnvelopeKind::Event, "topic must not be empty"));
            }
            RawEnvelopeRef {
                id: None,
                kind: EnvelopeKind::Event,
                method: None,
                topic: Some(topic.as_str()),
                payload,
                error: None,
            }
        }
    };

    let bytes = serde_json::to_vec(&raw).map_err(CodecError::Encode)?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(bytes)
}

/// Decode and validate wire bytes.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
    let kind = match raw.kind.as_str() {
        "request" => EnvelopeKind::Request,
        "response" => EnvelopeKind::Response,
        "event" => EnvelopeKind::Event,
        other => return Err(CodecError::UnknownKind(other.to_string())),
    };

    match kind {
        EnvelopeKind::Request => {
            forbid(kind, "topic", raw.topic.is_some())?;
            forbid(kind, "error", raw.error.is_some())?;
            let id = require_id(kind, raw.id)?;
            let method = match raw.method {
                Some(m) if !m.is_empty() => m,
                _ => return Err(malformed(kind, "missing method")),
            };
            Ok(Envelope::Request {
                id,
                method,
                payload: raw.payload,
            })
        }
        EnvelopeKind::Response => {
            forbid(kind, "method", raw.method.is_some())?;
            forbid(kind, "topic", raw.topic.is_some())?;
            let id = require_id(kind, raw.id)?;
            Ok(Envelope::Response {
                id,
                payload: raw.payload,
                error: raw.error,
            })
        }
        EnvelopeKind::Event => {
            forbid(kind, "id", raw.id.is_some())?;
            forbid(kind, "method", raw.method.is_some())?;
            forbid(kind, "error", raw.error.is_some())?;
            let topic = match raw.topic {
                Some(t) if !t.is_empty() => t,
                _ => return Err(malformed(kind, "missing topic")),
            };
            Ok(Envelope::Event {
                topic,
                payload: raw.payload,
            })
        }
    }
}

fn malformed(kind: EnvelopeKind, reason: impl Into<String>) -> CodecError {
    CodecError::Malformed {
        kind,
        reason: reason.into(),
    }
}

fn forbid(kind: EnvelopeKind, field: &str, present: bool) -> Result<(), CodecError> {
    if present {
        Err(malformed(kind, format!("unexpected field `{field}`")))
    } else {
        Ok(())
    }
}

fn require_id(kind: EnvelopeKind, id: Option<String>) -> Result<CallId, CodecError> {
    let id = id.ok_or_else(|| malformed(kind, "missing id"))?;
    CallId::parse(&id).map_err(|e| malformed(kind, format!("invalid id {id:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    fn decode_json(value: Value) -> Result<Envelope, CodecError> {
        decode(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_request_roundtrip() {
        let env = Envelope::request(CallId::new(), "ExecuteQuery", json!({"sql": "SELECT 1"}));
        let bytes = encode(&env).unwrap();
        assert_eq!(decode(&bytes).unwrap(), env);
    }

    #[test]
    fn test_failure_response_roundtrip() {
        let env = Envelope::failure(CallId::new(), WireError::method_not_found("Nope"));
        let decoded = decode(&encode(&env).unwrap()).unwrap();
        match decoded {
            Envelope::Response { error: Some(e), .. } => {
                assert_eq!(e.kind, ErrorKind::MethodNotFound)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_event_wire_shape_has_no_id() {
        let env = Envelope::event("invalidate-query", json!("tasks"));
        let value: Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"kind": "event", "topic": "invalidate-query", "payload": "tasks"})
        );
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let env = decode_json(json!({"kind": "event", "topic": "ping"})).unwrap();
        assert_eq!(env.payload(), &Value::Null);
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let err = decode_json(json!({"kind": "notify", "topic": "x"})).unwrap_err();
        assert!(matches!(err, CodecError::UnknownKind(k) if k == "notify"));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = decode_json(json!({"kind": "event", "topic": "x", "extra": 1})).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_rejects_event_with_id() {
        let id = CallId::new().to_string();
        let err = decode_json(json!({"kind": "event", "id": id, "topic": "x"})).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Malformed {
                kind: EnvelopeKind::Event,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_request_without_method() {
        let id = CallId::new().to_string();
        assert!(decode_json(json!({"kind": "request", "id": id})).is_err());
        assert!(decode_json(json!({"kind": "request", "id": id, "method": ""})).is_err());
    }

    #[test]
    fn test_rejects_request_with_malformed_id() {
        let err =
            decode_json(json!({"kind": "request", "id": "42", "method": "Ping"})).unwrap_err();
        assert!(err.to_string().contains("invalid id"));
    }

    #[test]
    fn test_rejects_response_with_method() {
        let id = CallId::new().to_string();
        assert!(decode_json(json!({"kind": "response", "id": id, "method": "Ping"})).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_encode_rejects_empty_topic() {
        assert!(encode(&Envelope::event("", Value::Null)).is_err());
    }
}
