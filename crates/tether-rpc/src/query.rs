//! # Query Proxy
//!
//! Lets a satellite run database operations without touching storage. The
//! satellite side forwards `{sql, params, mode}` verbatim over
//! `ExecuteQuery`; the host side binds the method to a [`QueryExecutor`].
//! No caching, no planning, no business logic in between.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tether_types::{LinkError, QueryMode, QueryRequest, QueryResult, EXECUTE_QUERY};
use thiserror::Error;
use tracing::debug;

use crate::client::CallOptions;
use crate::connection::ConnectionManager;
use crate::server::{typed_handler, HandlerError, MethodRegistry, RegistryError};

/// Failures reported by a [`QueryExecutor`].
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Execution(String),

    #[error("unsupported parameter: {0}")]
    Parameter(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<QueryError> for HandlerError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Parameter(m) => HandlerError::InvalidParams(m),
            QueryError::Execution(m) => HandlerError::Failed(m),
            QueryError::Other(e) => HandlerError::Other(e),
        }
    }
}

/// The host's database engine, seen through one operation.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, request: QueryRequest) -> Result<QueryResult, QueryError>;
}

/// Bind `executor` to `ExecuteQuery` on the host registry.
pub fn register_query_handler(
    registry: &MethodRegistry,
    executor: Arc<dyn QueryExecutor>,
) -> Result<(), RegistryError> {
    registry.register(
        EXECUTE_QUERY,
        typed_handler(move |request: QueryRequest| {
            let executor = executor.clone();
            async move {
                debug!(mode = %request.mode, "Executing query");
                Ok::<_, HandlerError>(executor.execute(request).await?)
            }
        }),
    )
}

/// Satellite-side entry point for `ExecuteQuery`.
#[derive(Clone)]
pub struct QueryProxy {
    connections: ConnectionManager,
}

impl QueryProxy {
    pub fn new(connections: ConnectionManager) -> Self {
        Self { connections }
    }

    /// Run `sql` on the host. Executor failures surface as
    /// [`LinkError::RemoteHandler`].
    pub async fn execute(
        &self,
        sql: &str,
        params: Vec<Value>,
        mode: QueryMode,
    ) -> Result<QueryResult, LinkError> {
        self.execute_with(QueryRequest::new(sql, params, mode), CallOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        request: QueryRequest,
        options: CallOptions,
    ) -> Result<QueryResult, LinkError> {
        let conn = self.connections.ensure_connection().await?;
        conn.client()
            .call_typed(EXECUTE_QUERY, &request, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::OnceConnector;
    use crate::server::RpcServer;
    use crate::RpcConfig;
    use serde_json::json;
    use tether_transport::{memory_pair, Transport};
    use tether_types::ErrorKind;

    /// Executor that answers `SELECT 1` and fails on anything else.
    struct FakeExecutor;

    #[async_trait]
    impl QueryExecutor for FakeExecutor {
        async fn execute(&self, request: QueryRequest) -> Result<QueryResult, QueryError> {
            match request.sql.as_str() {
                "SELECT 1" => Ok(QueryResult {
                    rows: vec![json!([1])],
                }),
                "SELECT ?" => Ok(QueryResult {
                    rows: vec![Value::Array(request.params)],
                }),
                other => Err(QueryError::Execution(format!("no such table in {other:?}"))),
            }
        }
    }

    fn proxy() -> (QueryProxy, Arc<dyn Transport>) {
        let registry = Arc::new(MethodRegistry::new());
        register_query_handler(&registry, Arc::new(FakeExecutor)).unwrap();

        let (host, satellite) = memory_pair();
        let host: Arc<dyn Transport> = host;
        RpcServer::new(registry).serve(host.clone());

        let manager = ConnectionManager::new(
            Arc::new(OnceConnector::new(satellite)),
            RpcConfig::default(),
        );
        (QueryProxy::new(manager), host)
    }

    #[tokio::test]
    async fn test_execute_forwards_to_executor() {
        let (proxy, _host) = proxy();
        let result = proxy.execute("SELECT 1", vec![], QueryMode::All).await.unwrap();
        assert_eq!(result.rows, vec![json!([1])]);
    }

    #[tokio::test]
    async fn test_params_are_forwarded_verbatim() {
        let (proxy, _host) = proxy();
        let result = proxy
            .execute("SELECT ?", vec![json!("a"), json!(2)], QueryMode::Values)
            .await
            .unwrap();
        assert_eq!(result.rows, vec![json!(["a", 2])]);
    }

    #[tokio::test]
    async fn test_executor_failure_is_remote_error() {
        let (proxy, _host) = proxy();
        let err = proxy
            .execute("SELECT * FROM missing", vec![], QueryMode::All)
            .await
            .unwrap_err();
        assert_eq!(err.remote_kind(), Some(ErrorKind::Handler));
        assert!(err.to_string().contains("no such table"));
    }

    #[test]
    fn test_double_registration_rejected() {
        let registry = MethodRegistry::new();
        register_query_handler(&registry, Arc::new(FakeExecutor)).unwrap();
        assert!(register_query_handler(&registry, Arc::new(FakeExecutor)).is_err());
    }
}
