//! Structured logging.
//!
//! Every crate logs through `tracing` with structured fields (`method`,
//! `call_id`, `topic`, `peer`, `ref_key`, `version`). This module installs the
//! process-wide subscriber that renders them, either human-readable or JSON.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{TelemetryConfig, TelemetryError};

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.log_level` when set. If a global subscriber
/// is already installed (a second context in the same process, or a test
/// harness) the call is a no-op.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    let layer = if !config.console_output {
        None
    } else if config.json_logs {
        Some(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        )
    } else {
        Some(fmt::layer().with_target(true).boxed())
    };

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init();

    match result {
        Ok(()) => tracing::debug!(
            service = %config.full_service_name(),
            json_logs = config.json_logs,
            "Structured logging initialized"
        ),
        Err(_) => tracing::debug!("Global subscriber already installed"),
    }

    Ok(())
}
