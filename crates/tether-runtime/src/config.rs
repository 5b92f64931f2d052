//! # Runtime Configuration
//!
//! Unified configuration for both sides of the link. Every value has a
//! default; environment variables override them.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TETHER_CALL_TIMEOUT_MS` | `30000` | Default RPC deadline |
//! | `TETHER_HANDSHAKE_TIMEOUT_MS` | `5000` | Handshake deadline |
//! | `TETHER_HANDLER_TIMEOUT_MS` | unset | Host-side handler limit |
//! | `TETHER_MAX_FRAME_BYTES` | `10485760` | Largest accepted envelope, at most the default |

use std::time::Duration;
use tether_rpc::RpcConfig;
use tether_telemetry::TelemetryConfig;
use tether_types::MAX_FRAME_BYTES;
use thiserror::Error;
use tracing::warn;

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct TetherConfig {
    /// Call, handshake and handler deadlines.
    pub rpc: RpcConfig,
    /// Channel limits.
    pub transport: TransportConfig,
    /// Logging setup.
    pub telemetry: TelemetryConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Largest encoded envelope accepted in either direction.
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("max frame size {0} is outside 1..={max}", max = MAX_FRAME_BYTES)]
    FrameLimit(usize),
}

impl TetherConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        let mut config = Self {
            telemetry: TelemetryConfig::from_env(),
            ..Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Apply overrides from `lookup`. Unparsable values are logged and
    /// ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            match raw.trim().parse() {
                Ok(ms) => Some(ms),
                Err(_) => {
                    warn!(variable = name, value = %raw, "Ignoring invalid millisecond value");
                    None
                }
            }
        };

        if let Some(ms) = millis("TETHER_CALL_TIMEOUT_MS") {
            self.rpc.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("TETHER_HANDSHAKE_TIMEOUT_MS") {
            self.rpc.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("TETHER_HANDLER_TIMEOUT_MS") {
            self.rpc.handler_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(raw) = lookup("TETHER_MAX_FRAME_BYTES") {
            match raw.trim().parse() {
                Ok(bytes) => self.transport.max_frame_bytes = bytes,
                Err(_) => warn!(value = %raw, "Ignoring invalid TETHER_MAX_FRAME_BYTES"),
            }
        }
    }

    /// Check limits before any channel is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.call_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("call timeout"));
        }
        if self.rpc.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("handshake timeout"));
        }
        if self.rpc.handler_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroDuration("handler timeout"));
        }
        let max = self.transport.max_frame_bytes;
        // The codec caps every envelope at MAX_FRAME_BYTES; a larger stream
        // limit would never be reached.
        if max == 0 || max > MAX_FRAME_BYTES {
            return Err(ConfigError::FrameLimit(max));
        }
        Ok(())
    }
}
