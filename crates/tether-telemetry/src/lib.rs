//! # Tether Telemetry
//!
//! Logging and metrics for both sides of the link.
//!
//! ## Components
//!
//! - **Logging**: `tracing` subscriber with env filter, text or JSON output
//! - **Metrics**: Prometheus collectors for RPC, pub/sub, transport and refs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::from_env();
//! let _guard = init_telemetry(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TETHER_SERVICE_NAME` | `tether` | Service name in log lines |
//! | `TETHER_ROLE` | `host` | Process role |
//! | `TETHER_LOG_LEVEL` | `info` | Log level filter |
//! | `TETHER_JSON_LOGS` | `false` | JSON formatted logs |
//! | `TETHER_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::{
    gather_metrics, register_metrics, MetricsHandle, EVENTS_DELIVERED, EVENTS_PUBLISHED,
    FRAMES_REJECTED, HANDSHAKES, PEERS_ATTACHED, REF_WRITES, RPC_CALLS, RPC_HANDLER_DURATION,
    RPC_PENDING_CALLS, RPC_REQUESTS_HANDLED, RPC_STALE_RESPONSES,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and register metrics.
///
/// Returns a guard that should be held for the lifetime of the process.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics_handle = register_metrics()?;
    init_logging(config)?;

    tracing::info!(service = %config.full_service_name(), "Telemetry initialized");

    Ok(TelemetryGuard {
        _metrics: metrics_handle,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}

/// Convenience macro for recording a metric increment.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $labels:expr) => {
        $metric.with_label_values($labels).inc()
    };
}
