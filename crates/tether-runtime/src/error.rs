use tether_rpc::RegistryError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while building or running a context.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("method registration failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
