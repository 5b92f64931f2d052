//! # Connection Manager
//!
//! Guarantees a ready channel before any satellite call, with single-flight
//! bootstrap:
//!
//! ```text
//!                 ensure_connection()
//!   Disconnected ───────────────────▶ Connecting ──ok──▶ Connected
//!        ▲                               │                  │
//!        │                             error           transport
//!        │                               ▼               closed
//!        │                             Failed               │
//!        │                               │ next call        │
//!        │                               └──▶ Connecting    │
//!        └──────────────────────────────────────────────────┘
//! ```
//!
//! The first caller starts `Connector::connect` plus the `$handshake` round
//! trip and parks the shared in-flight future in the slot. Every concurrent
//! caller awaits that same future, so N callers produce one handshake and
//! receive the same [`Connection`].

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_telemetry::{metric_inc, HANDSHAKES};
use tether_transport::Transport;
use tether_types::{LinkError, PROTOCOL_VERSION};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{CallOptions, RpcClient};
use crate::handshake::{HandshakeRequest, HandshakeResponse, HANDSHAKE_METHOD};
use crate::RpcConfig;

/// Lifecycle of the satellite's link to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Opens a raw channel to the host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>, LinkError>;
}

/// Session details agreed during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub protocol_version: u16,
}

/// A handshaken channel: transport, RPC client and session.
pub struct Connection {
    transport: Arc<dyn Transport>,
    client: RpcClient,
    session: SessionInfo,
    generation: u64,
}

impl Connection {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Increments with every successful handshake on the same manager.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        !self.transport.is_closed()
    }

    pub fn close(&self) {
        self.transport.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel", &self.transport.label())
            .field("session", &self.session)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Runs for each new connection before it is handed to callers.
pub type ConnectHook = Arc<dyn Fn(&Connection) + Send + Sync>;

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<Connection>, LinkError>>>;

enum Slot {
    Idle,
    InFlight(ConnectFuture),
    Ready(Arc<Connection>),
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: RpcConfig,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ConnectionState>,
    hooks: RwLock<Vec<ConnectHook>>,
    handshakes: AtomicU64,
    generation: AtomicU64,
}

/// Cloneable handle; clones share one slot.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: RpcConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                slot: Mutex::new(Slot::Idle),
                state_tx,
                hooks: RwLock::new(Vec::new()),
                handshakes: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Return the connected handle, connecting first if needed.
    pub async fn ensure_connection(&self) -> Result<Arc<Connection>, LinkError> {
        let pending = {
            let mut slot = self.inner.slot.lock();
            match &*slot {
                Slot::Ready(conn) if conn.is_open() => return Ok(conn.clone()),
                Slot::InFlight(fut) => fut.clone(),
                _ => {
                    let inner = self.inner.clone();
                    let fut = async move { inner.establish().await }.boxed().shared();
                    *slot = Slot::InFlight(fut.clone());
                    self.inner.set_state(ConnectionState::Connecting);
                    fut
                }
            }
        };
        pending.await
    }

    /// Call `method` over the current connection.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, LinkError> {
        let conn = self.ensure_connection().await?;
        conn.client().call(method, params, options).await
    }

    /// Register a hook run for every new connection. Applies to connections
    /// made after registration only.
    pub fn on_connect(&self, hook: ConnectHook) {
        self.inner.hooks.write().push(hook);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// The cached connection, if connected.
    pub fn current(&self) -> Option<Arc<Connection>> {
        match &*self.inner.slot.lock() {
            Slot::Ready(conn) if conn.is_open() => Some(conn.clone()),
            _ => None,
        }
    }

    /// Number of handshake attempts started by this manager.
    pub fn handshake_count(&self) -> u64 {
        self.inner.handshakes.load(Ordering::SeqCst)
    }

    /// Close the current connection. The next call reconnects.
    pub fn disconnect(&self) {
        let previous = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Ready(conn) => Some(conn),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(conn) = previous {
            info!(session_id = %conn.session.session_id, "Disconnecting");
            conn.close();
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    async fn establish(self: Arc<Self>) -> Result<Arc<Connection>, LinkError> {
        let result = self.handshake().await;

        let mut slot = self.slot.lock();
        match &result {
            Ok(conn) => {
                *slot = Slot::Ready(conn.clone());
                self.set_state(ConnectionState::Connected);
                self.watch_close(conn);
            }
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                *slot = Slot::Idle;
                self.set_state(ConnectionState::Failed);
            }
        }
        result
    }

    async fn handshake(&self) -> Result<Arc<Connection>, LinkError> {
        let attempt = self.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, "Starting handshake");

        let transport = match self.connector.connect().await {
            Ok(transport) => transport,
            Err(e) => {
                metric_inc!(HANDSHAKES, &["failed"]);
                return Err(e);
            }
        };

        let client = RpcClient::new(transport.clone(), self.config.call_timeout);
        let request = HandshakeRequest {
            protocol_version: PROTOCOL_VERSION,
        };
        let response: HandshakeResponse = match client
            .call_typed(
                HANDSHAKE_METHOD,
                &request,
                CallOptions::timeout(self.config.handshake_timeout),
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                metric_inc!(HANDSHAKES, &["failed"]);
                transport.close();
                return Err(LinkError::Connection(format!("handshake failed: {e}")));
            }
        };

        if response.protocol_version != PROTOCOL_VERSION {
            metric_inc!(HANDSHAKES, &["failed"]);
            transport.close();
            return Err(LinkError::Connection(format!(
                "protocol version mismatch: host {}, satellite {}",
                response.protocol_version, PROTOCOL_VERSION
            )));
        }

        let conn = Arc::new(Connection {
            transport,
            client,
            session: SessionInfo {
                session_id: response.session_id,
                protocol_version: response.protocol_version,
            },
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        });

        let hooks: Vec<ConnectHook> = self.hooks.read().clone();
        for hook in hooks {
            hook(&conn);
        }

        metric_inc!(HANDSHAKES, &["success"]);
        info!(
            session_id = %conn.session.session_id,
            generation = conn.generation,
            channel = conn.transport.label(),
            "Connected to host"
        );
        Ok(conn)
    }

    /// Reset to `Disconnected` once this connection's transport closes.
    fn watch_close(self: &Arc<Self>, conn: &Arc<Connection>) {
        let inner: Weak<Inner> = Arc::downgrade(self);
        let transport = conn.transport.clone();
        let generation = conn.generation;

        tokio::spawn(async move {
            transport.closed().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut slot = inner.slot.lock();
            if matches!(&*slot, Slot::Ready(c) if c.generation == generation) {
                *slot = Slot::Idle;
                inner.set_state(ConnectionState::Disconnected);
                info!(generation, "Connection closed");
            }
        });
    }
}

/// Connector that hands out a pre-built transport once, mostly for tests and
/// embedding.
pub struct OnceConnector {
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl OnceConnector {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
        }
    }
}

#[async_trait]
impl Connector for OnceConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, LinkError> {
        self.transport
            .lock()
            .take()
            .ok_or_else(|| LinkError::Transport("connector already used".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{MethodRegistry, RpcServer};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tether_transport::memory_pair;

    /// Connector that builds a fresh memory pair per attempt and serves the
    /// host side with the given registry.
    struct TestConnector {
        server: RpcServer,
        connects: AtomicUsize,
        fail_first: AtomicUsize,
        hosts: Mutex<Vec<Arc<dyn Transport>>>,
    }

    impl TestConnector {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                server: RpcServer::new(Arc::new(MethodRegistry::new())),
                connects: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(fail_first),
                hosts: Mutex::new(Vec::new()),
            })
        }

        fn last_host(&self) -> Arc<dyn Transport> {
            self.hosts.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn connect(&self) -> Result<Arc<dyn Transport>, LinkError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(LinkError::Transport("host not ready".into()));
            }
            let (host, satellite) = memory_pair();
            let host: Arc<dyn Transport> = host;
            self.server.serve(host.clone());
            self.hosts.lock().push(host);
            Ok(satellite)
        }
    }

    fn manager(connector: Arc<TestConnector>) -> ConnectionManager {
        ConnectionManager::new(connector, RpcConfig::default())
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_handshake() {
        let connector = TestConnector::new(0);
        let manager = manager(connector.clone());

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ensure_connection().await })
            })
            .collect();

        let mut conns = Vec::new();
        for attempt in attempts {
            conns.push(attempt.await.unwrap().unwrap());
        }

        assert_eq!(manager.handshake_count(), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnects_after_close() {
        let connector = TestConnector::new(0);
        let manager = manager(connector.clone());

        let first = manager.ensure_connection().await.unwrap();
        let mut states = manager.watch_state();
        connector.last_host().close();
        states
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();

        let second = manager.ensure_connection().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.generation(), 2);
        assert_eq!(manager.handshake_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_then_retry() {
        let connector = TestConnector::new(1);
        let manager = manager(connector.clone());

        let err = manager.ensure_connection().await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
        assert_eq!(manager.state(), ConnectionState::Failed);

        manager.ensure_connection().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.handshake_count(), 2);
    }

    #[tokio::test]
    async fn test_hooks_run_before_publish() {
        let connector = TestConnector::new(0);
        let manager = manager(connector);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        manager.on_connect(Arc::new(move |_conn: &Connection| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        manager.ensure_connection().await.unwrap();
        manager.ensure_connection().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect() {
        let connector = TestConnector::new(0);
        let manager = manager(connector);
        let conn = manager.ensure_connection().await.unwrap();

        manager.disconnect();
        assert!(!conn.is_open());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_handshake_is_connection_error() {
        let (_host, satellite) = memory_pair();
        let manager = ConnectionManager::new(
            Arc::new(OnceConnector::new(satellite)),
            RpcConfig {
                handshake_timeout: Duration::from_millis(200),
                ..RpcConfig::default()
            },
        );

        let err = manager.ensure_connection().await.unwrap_err();
        assert!(matches!(err, LinkError::Connection(_)));
        assert_eq!(manager.state(), ConnectionState::Failed);
    }
}
