//! # Host Context
//!
//! Owns everything the privileged process exposes to satellites: one method
//! registry and RPC server, the host bus and the reference store. Built once
//! per process and shared by clone.
//!
//! Each attached channel gets a [`PeerId`], is served by the RPC server,
//! joins the bus broadcast set, and is detached automatically when it
//! closes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_bus::HostBus;
use tether_refs::RefStore;
use tether_rpc::{
    register_query_handler, MethodRegistry, QueryExecutor, RegistryError, RpcServer, ServeHandle,
};
use tether_telemetry::PEERS_ATTACHED;
use tether_transport::Transport;
use tether_types::PeerId;
use tokio::sync::watch;
use tracing::info;

use crate::config::TetherConfig;
use crate::connector::LocalConnector;
use crate::error::RuntimeError;

struct PeerLink {
    transport: Arc<dyn Transport>,
    serve: ServeHandle,
}

struct HostInner {
    config: TetherConfig,
    registry: Arc<MethodRegistry>,
    server: RpcServer,
    bus: HostBus,
    refs: Arc<RefStore>,
    peers: Mutex<HashMap<PeerId, PeerLink>>,
    next_peer: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl HostInner {
    fn detach(&self, peer: PeerId) -> bool {
        let Some(link) = self.peers.lock().remove(&peer) else {
            return false;
        };
        link.serve.stop();
        self.bus.detach_peer(peer);
        PEERS_ATTACHED.dec();
        info!(%peer, channel = link.transport.label(), "Satellite detached");
        true
    }
}

/// Cloneable handle; clones share one host.
#[derive(Clone)]
pub struct HostContext {
    inner: Arc<HostInner>,
}

impl HostContext {
    /// Build the registry, server, bus and reference store.
    pub fn new(config: TetherConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let registry = Arc::new(MethodRegistry::new());
        let server = RpcServer::new(registry.clone()).with_handler_timeout(config.rpc.handler_timeout);
        let bus = HostBus::new();
        let refs = Arc::new(RefStore::new(bus.clone()));
        refs.register_methods(&registry)?;
        let (shutdown_tx, _) = watch::channel(false);

        info!(methods = ?registry.method_names(), "Host context ready");
        Ok(Self {
            inner: Arc::new(HostInner {
                config,
                registry,
                server,
                bus,
                refs,
                peers: Mutex::new(HashMap::new()),
                next_peer: AtomicU64::new(0),
                shutdown_tx,
            }),
        })
    }

    pub fn config(&self) -> &TetherConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.inner.registry
    }

    pub fn bus(&self) -> &HostBus {
        &self.inner.bus
    }

    pub fn refs(&self) -> &Arc<RefStore> {
        &self.inner.refs
    }

    /// Serve RPC and pub/sub on `transport`. Must be called inside a Tokio
    /// runtime.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> PeerId {
        let peer = PeerId(self.inner.next_peer.fetch_add(1, Ordering::SeqCst) + 1);
        let serve = self.inner.server.serve(transport.clone());
        self.inner.bus.attach_peer(peer, transport.clone());
        self.inner.peers.lock().insert(
            peer,
            PeerLink {
                transport: transport.clone(),
                serve,
            },
        );
        PEERS_ATTACHED.inc();
        info!(%peer, channel = transport.label(), "Satellite attached");

        let inner: Weak<HostInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            transport.closed().await;
            if let Some(inner) = inner.upgrade() {
                inner.detach(peer);
            }
        });
        peer
    }

    /// Close `peer`'s channel and stop serving it.
    pub fn detach(&self, peer: PeerId) -> bool {
        let transport = self
            .inner
            .peers
            .lock()
            .get(&peer)
            .map(|link| link.transport.clone());
        let detached = self.inner.detach(peer);
        if let Some(transport) = transport {
            transport.close();
        }
        detached
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.inner.peers.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Bind the database engine to `ExecuteQuery`.
    pub fn register_query_executor(&self, executor: Arc<dyn QueryExecutor>) -> Result<(), RegistryError> {
        register_query_handler(&self.inner.registry, executor)
    }

    /// Connector that opens in-process channels to this host.
    pub fn connector(&self) -> LocalConnector {
        LocalConnector::new(self.clone())
    }

    /// Accept satellites on a Unix socket at `path` until shutdown.
    #[cfg(unix)]
    pub fn listen_unix(&self, path: impl AsRef<std::path::Path>) -> Result<(), RuntimeError> {
        use tether_transport::StreamTransport;
        use tokio::net::UnixListener;
        use tracing::{debug, warn};

        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path)?;
        let max_frame_bytes = self.inner.config.transport.max_frame_bytes;
        let inner = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        info!(path = %path.display(), "Listening for satellites");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let Some(inner) = inner.upgrade() else { break };
                            let transport = StreamTransport::spawn_with_limit(stream, "unix-peer", max_frame_bytes);
                            HostContext { inner }.attach(transport);
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!(path = %path.display(), "Stopped listening");
            let _ = std::fs::remove_file(&path);
        });
        Ok(())
    }

    /// Close every peer and drop host-local subscriptions.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        for peer in self.peer_ids() {
            self.detach(peer);
        }
        self.inner.bus.clear();
        info!("Host context shut down");
    }
}
