//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for logging and metrics.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to log lines
    pub service_name: String,

    /// Process role (host, satellite)
    pub role: String,

    /// Log level filter (trace, debug, info, warn, error) or a full
    /// `EnvFilter` directive
    pub log_level: String,

    /// Whether to enable console output
    pub console_output: bool,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tether".to_string(),
            role: "host".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TETHER_SERVICE_NAME`: Service name (default: tether)
    /// - `TETHER_ROLE`: Process role (default: host)
    /// - `TETHER_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `TETHER_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `TETHER_JSON_LOGS`: Enable JSON logs (default: false)
    pub fn from_env() -> Self {
        Self {
            service_name: env::var("TETHER_SERVICE_NAME")
                .unwrap_or_else(|_| "tether".to_string()),

            role: env::var("TETHER_ROLE").unwrap_or_else(|_| "host".to_string()),

            log_level: env::var("TETHER_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("TETHER_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("TETHER_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Create configuration for a given process role.
    pub fn for_role(role: &str) -> Self {
        let mut config = Self::from_env();
        config.role = role.to_string();
        config
    }

    /// Service name qualified by role.
    pub fn full_service_name(&self) -> String {
        format!("{}-{}", self.service_name, self.role)
    }
}
