//! # RPC Server
//!
//! Host-side dispatch. A [`MethodRegistry`] maps unique method names to
//! handlers; [`RpcServer::serve`] attaches the registry to a transport.
//!
//! Every inbound `request` runs on its own task and produces exactly one
//! `response`. Methods registered with
//! [`register_ordered`](MethodRegistry::register_ordered) instead go through
//! one queue per transport and run one at a time in arrival order. Failures
//! never escape the dispatch task:
//!
//! | Failure                      | Wire `error.kind`   |
//! |------------------------------|---------------------|
//! | no handler for the method    | `method_not_found`  |
//! | params do not deserialize    | `invalid_params`    |
//! | handler returned an error    | `handler`           |
//! | handler panicked             | `handler`           |
//! | handler exceeded its deadline| `timeout`           |
//! | result could not be encoded  | `serialization`     |

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tether_telemetry::{metric_inc, time_histogram, RPC_HANDLER_DURATION, RPC_REQUESTS_HANDLED};
use tether_transport::{ListenerId, Transport};
use tether_types::{CallId, Envelope, ErrorKind, LinkError, WireError};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::handshake::{HandshakeHandler, HANDSHAKE_METHOD};

/// Failure returned by a handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Wire form sent back to the caller.
    pub fn into_wire(self) -> WireError {
        match self {
            Self::InvalidParams(m) => WireError::invalid_params(m),
            Self::Failed(m) => WireError::handler(m),
            Self::Serialization(e) => WireError::from(e),
            Self::Other(e) => WireError::handler(format!("{e:#}")),
        }
    }
}

/// A host-side method implementation.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, params: Value) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, params: Value) -> Result<Value, HandlerError> {
        (self.0)(params).await
    }
}

/// Adapt an async closure over raw JSON into a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Adapt an async closure over typed params and result into a handler.
///
/// Params that fail to deserialize are reported as `invalid_params`; a result
/// that fails to serialize as `serialization`.
pub fn typed_handler<P, R, F, Fut>(f: F) -> Arc<dyn MethodHandler>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    handler_fn(move |params: Value| {
        let call = serde_json::from_value::<P>(params).map(&f);
        async move {
            let fut = call.map_err(|e| HandlerError::InvalidParams(e.to_string()))?;
            let result = fut.await?;
            Ok(serde_json::to_value(result)?)
        }
    })
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("method {0} is already registered")]
    DuplicateMethod(String),

    #[error("method name must not be empty")]
    EmptyName,

    #[error("method name {0} is reserved")]
    Reserved(String),
}

struct Registered {
    handler: Arc<dyn MethodHandler>,
    ordered: bool,
}

/// Unique name → handler table. `$handshake` is always present.
pub struct MethodRegistry {
    handlers: RwLock<HashMap<String, Registered>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut handlers = HashMap::new();
        handlers.insert(
            HANDSHAKE_METHOD.to_string(),
            Registered {
                handler: Arc::new(HandshakeHandler) as Arc<dyn MethodHandler>,
                ordered: false,
            },
        );
        Self {
            handlers: RwLock::new(handlers),
        }
    }

    /// Register `handler` under `name`. Names are unique; names starting with
    /// `$` are reserved for built-ins.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), handler, false)
    }

    /// Register a method whose requests from one transport run one at a time,
    /// in the order they arrived.
    pub fn register_ordered(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), handler, true)
    }

    fn insert(
        &self,
        name: String,
        handler: Arc<dyn MethodHandler>,
        ordered: bool,
    ) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if name.starts_with('$') {
            return Err(RegistryError::Reserved(name));
        }

        let mut handlers = self.handlers.write();
        if handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateMethod(name));
        }
        debug!(method = %name, ordered, "Registered method");
        handlers.insert(name, Registered { handler, ordered });
        Ok(())
    }

    /// Shorthand for [`register`](Self::register) with [`handler_fn`].
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.register(name, handler_fn(f))
    }

    /// Remove a user method. Built-ins stay.
    pub fn unregister(&self, name: &str) -> bool {
        if name.starts_with('$') {
            return false;
        }
        self.handlers.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.read().get(name).map(|r| r.handler.clone())
    }

    pub fn is_ordered(&self, name: &str) -> bool {
        self.handlers.read().get(name).is_some_and(|r| r.ordered)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatches requests from any number of transports against one registry.
#[derive(Clone)]
pub struct RpcServer {
    registry: Arc<MethodRegistry>,
    handler_timeout: Option<Duration>,
}

/// Returned by [`RpcServer::serve`]; stops serving a transport on request.
pub struct ServeHandle {
    transport: Weak<dyn Transport>,
    listener: ListenerId,
}

impl ServeHandle {
    /// Stop dispatching requests from this transport. Requests already
    /// running still reply.
    pub fn stop(&self) {
        if let Some(transport) = self.transport.upgrade() {
            transport.remove_listener(self.listener);
        }
    }
}

impl RpcServer {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            handler_timeout: None,
        }
    }

    /// Fail handlers that run longer than `timeout` with a `timeout` error.
    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    /// Start answering requests arriving on `transport`. Must be called
    /// from within a tokio runtime.
    pub fn serve(&self, transport: Arc<dyn Transport>) -> ServeHandle {
        let weak = Arc::downgrade(&transport);
        let registry = self.registry.clone();
        let handler_timeout = self.handler_timeout;
        let reply_to = weak.clone();
        let ordered = spawn_ordered_worker(registry.clone(), handler_timeout, weak.clone());

        let listener = transport.on_message(Arc::new(move |envelope: &Envelope| {
            let Envelope::Request { id, method, payload } = envelope else {
                return;
            };
            let request = (*id, method.clone(), payload.clone());

            if registry.is_ordered(method) {
                if ordered.send(request).is_err() {
                    debug!(call_id = %id, method = %method, "Ordered queue closed");
                }
                return;
            }

            let (id, method, params) = request;
            let registry = registry.clone();
            let reply_to = reply_to.clone();
            tokio::spawn(async move {
                let outcome = dispatch(&registry, handler_timeout, &method, id, params).await;
                reply(&reply_to, id, &method, outcome);
            });
        }));

        debug!(channel = transport.label(), "Serving RPC");
        ServeHandle {
            transport: weak,
            listener,
        }
    }
}

type QueuedRequest = (CallId, String, Value);

/// One worker per transport drains ordered requests in arrival order. It
/// exits once the listener holding the sender is dropped.
fn spawn_ordered_worker(
    registry: Arc<MethodRegistry>,
    handler_timeout: Option<Duration>,
    reply_to: Weak<dyn Transport>,
) -> mpsc::UnboundedSender<QueuedRequest> {
    let (tx, mut rx) = mpsc::unbounded_channel::<QueuedRequest>();
    tokio::spawn(async move {
        while let Some((id, method, params)) = rx.recv().await {
            let outcome = dispatch(&registry, handler_timeout, &method, id, params).await;
            reply(&reply_to, id, &method, outcome);
        }
    });
    tx
}

async fn dispatch(
    registry: &MethodRegistry,
    handler_timeout: Option<Duration>,
    method: &str,
    id: CallId,
    params: Value,
) -> Result<Value, WireError> {
    let Some(handler) = registry.get(method) else {
        warn!(call_id = %id, method, "Request for unknown method");
        metric_inc!(RPC_REQUESTS_HANDLED, &["method_not_found"]);
        return Err(WireError::method_not_found(method));
    };

    let _timer = time_histogram!(RPC_HANDLER_DURATION);
    let guarded = AssertUnwindSafe(handler.handle(params)).catch_unwind();
    let result = match handler_timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => {
                warn!(call_id = %id, method, timeout_ms = limit.as_millis() as u64, "Handler timed out");
                metric_inc!(RPC_REQUESTS_HANDLED, &["timeout"]);
                return Err(WireError::new(
                    ErrorKind::Timeout,
                    format!("handler exceeded {}ms", limit.as_millis()),
                ));
            }
        },
        None => guarded.await,
    };

    match result {
        Ok(Ok(value)) => {
            metric_inc!(RPC_REQUESTS_HANDLED, &["ok"]);
            Ok(value)
        }
        Ok(Err(e)) => {
            let wire = e.into_wire();
            warn!(call_id = %id, method, kind = %wire.kind, error = %wire.message, "Handler failed");
            metric_inc!(RPC_REQUESTS_HANDLED, &[wire.kind.as_str()]);
            Err(wire)
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(call_id = %id, method, panic = %detail, "Handler panicked");
            metric_inc!(RPC_REQUESTS_HANDLED, &["handler"]);
            Err(WireError::handler("handler panicked"))
        }
    }
}

fn reply(
    transport: &Weak<dyn Transport>,
    id: CallId,
    method: &str,
    outcome: Result<Value, WireError>,
) {
    let Some(transport) = transport.upgrade() else {
        debug!(call_id = %id, method, "Transport gone before reply");
        return;
    };

    let envelope = match outcome {
        Ok(value) => Envelope::success(id, value),
        Err(e) => Envelope::failure(id, e),
    };

    match transport.send(envelope) {
        Ok(()) => {}
        Err(LinkError::Serialization(message)) => {
            warn!(call_id = %id, method, error = %message, "Result could not be encoded");
            let fallback = Envelope::failure(id, WireError::new(ErrorKind::Serialization, message));
            if let Err(e) = transport.send(fallback) {
                debug!(call_id = %id, method, error = %e, "Failed to send reply");
            }
        }
        Err(e) => debug!(call_id = %id, method, error = %e, "Failed to send reply"),
    }
}
