//! # Satellite Context
//!
//! Everything an isolated process needs to talk to the host, built once and
//! shared by clone: the connection manager, the satellite bus, the reference
//! mirror and the query proxy. The bus is re-attached to every new
//! connection before that connection is handed to callers.

use serde_json::Value;
use std::sync::Arc;
use tether_bus::SatelliteBus;
use tether_refs::RefMirror;
use tether_rpc::{CallOptions, Connection, ConnectionManager, Connector, QueryProxy};
use tether_types::{LinkError, QueryMode, QueryResult};
use tracing::info;

use crate::config::TetherConfig;
use crate::error::RuntimeError;

#[derive(Clone)]
pub struct SatelliteContext {
    config: TetherConfig,
    connections: ConnectionManager,
    bus: SatelliteBus,
    refs: RefMirror,
    queries: QueryProxy,
}

impl SatelliteContext {
    pub fn new(connector: Arc<dyn Connector>, config: TetherConfig) -> Result<Self, RuntimeError> {
        config.validate()?;

        let connections = ConnectionManager::new(connector, config.rpc.clone());
        let bus = SatelliteBus::new();
        let hook_bus = bus.clone();
        connections.on_connect(Arc::new(move |conn: &Connection| {
            hook_bus.attach(conn.transport().clone());
        }));
        let refs = RefMirror::new(&bus, connections.clone());
        let queries = QueryProxy::new(connections.clone());

        Ok(Self {
            config,
            connections,
            bus,
            refs,
            queries,
        })
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn bus(&self) -> &SatelliteBus {
        &self.bus
    }

    pub fn refs(&self) -> &RefMirror {
        &self.refs
    }

    pub fn queries(&self) -> &QueryProxy {
        &self.queries
    }

    pub async fn ensure_connection(&self) -> Result<Arc<Connection>, LinkError> {
        self.connections.ensure_connection().await
    }

    /// Call a host method with the configured default deadline.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, LinkError> {
        self.connections
            .call(method, params, CallOptions::default())
            .await
    }

    pub async fn execute_query(
        &self,
        sql: &str,
        params: Vec<Value>,
        mode: QueryMode,
    ) -> Result<QueryResult, LinkError> {
        self.queries.execute(sql, params, mode).await
    }

    /// Dispose every subscription and close the connection.
    pub fn shutdown(&self) {
        self.refs.detach();
        let disposed = self.bus.teardown();
        self.connections.disconnect();
        info!(disposed, "Satellite context shut down");
    }
}
