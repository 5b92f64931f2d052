//! Pending-call table.
//!
//! Maps call ids to the callers waiting on them. Every entry leaves the table
//! exactly once: through [`PendingCallTable::complete`] when a response
//! arrives, or through [`PendingCallTable::discard`] on timeout, cancellation,
//! send failure or channel close. A response for an id that already left is
//! stale and dropped.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tether_telemetry::{metric_inc, RPC_PENDING_CALLS, RPC_STALE_RESPONSES};
use tether_types::{CallId, LinkError, WireError};
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome delivered to a waiting caller.
pub(crate) type CallOutcome = Result<Value, LinkError>;

/// A call waiting for its response
struct PendingCall {
    /// Channel to deliver the outcome
    sender: oneshot::Sender<CallOutcome>,
    /// When the call was issued
    created_at: Instant,
    /// Method name (for logging and error context)
    method: String,
    /// Deadline the caller is waiting against
    timeout: Duration,
}

/// Counters for the pending table
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total calls registered
    pub total_registered: AtomicU64,
    /// Total calls completed by a response
    pub total_completed: AtomicU64,
    /// Total calls removed without a response
    pub total_discarded: AtomicU64,
    /// Responses that matched no pending call
    pub total_stale: AtomicU64,
}

pub struct PendingCallTable {
    pending: DashMap<CallId, PendingCall>,
    stats: PendingStats,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            stats: PendingStats::default(),
        }
    }

    /// Register a call and get the receiver its outcome will arrive on.
    pub(crate) fn register(
        &self,
        method: &str,
        timeout: Duration,
    ) -> (CallId, oneshot::Receiver<CallOutcome>) {
        let id = CallId::new();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            id,
            PendingCall {
                sender: tx,
                created_at: Instant::now(),
                method: method.to_string(),
                timeout,
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        RPC_PENDING_CALLS.inc();

        debug!(call_id = %id, method, "Registered pending call");
        (id, rx)
    }

    /// Resolve a pending call with the response payload or its embedded error.
    ///
    /// Returns false when no call was waiting (stale or unknown id).
    pub fn complete(&self, id: CallId, result: Result<Value, WireError>) -> bool {
        let Some((_, call)) = self.pending.remove(&id) else {
            self.stats.total_stale.fetch_add(1, Ordering::Relaxed);
            metric_inc!(RPC_STALE_RESPONSES);
            debug!(call_id = %id, "Dropping response for unknown or expired call");
            return false;
        };
        RPC_PENDING_CALLS.dec();

        let elapsed = call.created_at.elapsed();
        let outcome = result.map_err(|e| LinkError::remote(&call.method, e));
        match call.sender.send(outcome) {
            Ok(()) => {
                self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    call_id = %id,
                    method = call.method,
                    response_time_ms = elapsed.as_millis() as u64,
                    "Completed pending call"
                );
                true
            }
            Err(_) => {
                // Caller went away between removal and send.
                self.stats.total_discarded.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Remove a call without resolving it. Returns true if it was present.
    pub fn discard(&self, id: &CallId) -> bool {
        match self.pending.remove(id) {
            Some((_, call)) => {
                RPC_PENDING_CALLS.dec();
                self.stats.total_discarded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    call_id = %id,
                    method = call.method,
                    timeout_ms = call.timeout.as_millis() as u64,
                    "Discarded pending call"
                );
                true
            }
            None => false,
        }
    }

    /// Fail every pending call with `error`.
    pub fn fail_all(&self, error: LinkError) -> usize {
        let ids: Vec<CallId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                RPC_PENDING_CALLS.dec();
                self.stats.total_discarded.fetch_add(1, Ordering::Relaxed);
                let _ = call.sender.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &CallId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }
}

impl Default for PendingCallTable {
    fn default() -> Self {
        Self::new()
    }
}
