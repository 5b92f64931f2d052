//! Built-in `$handshake` method.
//!
//! The first round trip on every new channel. The satellite sends its
//! protocol version; the host answers with a fresh session id and its own
//! version. A mismatch is rejected by the satellite.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_types::PROTOCOL_VERSION;
use uuid::Uuid;

use crate::server::{HandlerError, MethodHandler};

/// Reserved method name; user handlers cannot take it.
pub const HANDSHAKE_METHOD: &str = "$handshake";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub protocol_version: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub session_id: Uuid,
    pub protocol_version: u16,
}

pub(crate) struct HandshakeHandler;

#[async_trait]
impl MethodHandler for HandshakeHandler {
    async fn handle(&self, params: Value) -> Result<Value, HandlerError> {
        let request: HandshakeRequest = serde_json::from_value(params)
            .map_err(|e| HandlerError::InvalidParams(e.to_string()))?;

        let response = HandshakeResponse {
            session_id: Uuid::new_v4(),
            protocol_version: PROTOCOL_VERSION,
        };
        tracing::debug!(
            session_id = %response.session_id,
            client_version = request.protocol_version,
            "Handshake accepted"
        );
        Ok(serde_json::to_value(response)?)
    }
}
