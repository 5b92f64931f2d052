//! # RPC Client
//!
//! Satellite-side caller. Each call gets a fresh [`CallId`], an entry in the
//! pending table and a `request` envelope; the caller then suspends until one
//! of four things happens first:
//!
//! | Event                   | Outcome                               |
//! |-------------------------|---------------------------------------|
//! | matching response       | payload, or `RemoteHandler` error     |
//! | deadline elapses        | `Timeout`; a late response is stale   |
//! | cancel token / drop     | `Cancelled` / entry discarded         |
//! | channel closes          | `Transport`                           |
//!
//! The entry is always removed before the caller resumes, so a call resolves
//! exactly once.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tether_telemetry::{metric_inc, RPC_CALLS};
use tether_transport::{ListenerId, Transport};
use tether_types::{CallId, Envelope, LinkError};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::pending::PendingCallTable;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the client's default deadline.
    pub timeout: Option<Duration>,
    /// Abandons the call when fired.
    pub cancel: Option<CancelToken>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

pub struct RpcClient {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingCallTable>,
    default_timeout: Duration,
    listener: ListenerId,
}

impl RpcClient {
    /// Attach a client to `transport`. Responses are routed to the pending
    /// table from the transport's reader task.
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Duration) -> Self {
        let pending = Arc::new(PendingCallTable::new());

        let table = pending.clone();
        let listener = transport.on_message(Arc::new(move |envelope: &Envelope| {
            if let Envelope::Response { id, payload, error } = envelope {
                let result = match error {
                    Some(e) => Err(e.clone()),
                    None => Ok(payload.clone()),
                };
                table.complete(*id, result);
            }
        }));

        Self {
            transport,
            pending,
            default_timeout,
            listener,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of calls currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    /// Responses that arrived after their call had already resolved.
    pub fn stale_count(&self) -> u64 {
        self.pending.stats().total_stale.load(Ordering::Relaxed)
    }

    /// Invoke `method` on the host.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        options: CallOptions,
    ) -> Result<Value, LinkError> {
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let (id, rx) = self.pending.register(method, timeout);
        let _guard = PendingGuard {
            table: &self.pending,
            id,
        };

        if let Err(e) = self.transport.send(Envelope::request(id, method, params)) {
            warn!(call_id = %id, method, error = %e, "Failed to send request");
            record(&Err(e.clone()));
            return Err(e);
        }

        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            received = rx => match received {
                Ok(outcome) => outcome,
                Err(_) => Err(LinkError::Transport("call abandoned by channel".into())),
            },
            _ = tokio::time::sleep(timeout) => {
                debug!(call_id = %id, method, timeout_ms = timeout.as_millis() as u64, "Call timed out");
                Err(LinkError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            _ = cancelled => {
                debug!(call_id = %id, method, "Call cancelled");
                Err(LinkError::Cancelled { method: method.to_string() })
            }
            _ = self.transport.closed() => {
                Err(LinkError::Transport(format!("channel closed while awaiting {method}")))
            }
        };

        record(&outcome);
        outcome
    }

    /// Invoke `method` with typed params and result.
    pub async fn call_typed<P, R>(
        &self,
        method: &str,
        params: &P,
        options: CallOptions,
    ) -> Result<R, LinkError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.call(method, params, options).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.transport.remove_listener(self.listener);
    }
}

/// Removes the pending entry however the call ends, including when the
/// caller's future is dropped mid-flight.
struct PendingGuard<'a> {
    table: &'a PendingCallTable,
    id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.discard(&self.id);
    }
}

fn record(outcome: &Result<Value, LinkError>) {
    let label = match outcome {
        Ok(_) => "ok",
        Err(LinkError::RemoteHandler { .. }) => "remote_error",
        Err(LinkError::Timeout { .. }) => "timeout",
        Err(LinkError::Cancelled { .. }) => "cancelled",
        Err(LinkError::Serialization(_)) => "serialization",
        Err(_) => "transport",
    };
    metric_inc!(RPC_CALLS, &[label]);
}
