//! Connectors that open a raw channel to the host.

use async_trait::async_trait;
use std::sync::Arc;
use tether_rpc::Connector;
use tether_transport::{memory_pair_with_limit, Transport};
use tether_types::LinkError;
use tracing::debug;

use crate::host::HostContext;

/// Opens an in-process channel to a [`HostContext`] on every connect.
#[derive(Clone)]
pub struct LocalConnector {
    host: HostContext,
}

impl LocalConnector {
    pub fn new(host: HostContext) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, LinkError> {
        let (host_side, satellite_side) =
            memory_pair_with_limit(self.host.config().transport.max_frame_bytes);
        let peer = self.host.attach(host_side);
        debug!(%peer, "Opened in-process channel");
        Ok(satellite_side)
    }
}

/// Connects to a host listening on a Unix socket.
#[cfg(unix)]
pub struct UnixConnector {
    path: std::path::PathBuf,
    max_frame_bytes: usize,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_frame_bytes: tether_types::MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, LinkError> {
        let stream = tokio::net::UnixStream::connect(&self.path)
            .await
            .map_err(|e| {
                LinkError::Transport(format!("connect to {}: {e}", self.path.display()))
            })?;
        debug!(path = %self.path.display(), "Connected to host socket");
        Ok(tether_transport::StreamTransport::spawn_with_limit(
            stream,
            "unix-satellite",
            self.max_frame_bytes,
        ))
    }
}
