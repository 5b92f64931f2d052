//! Shared state behind every transport implementation.
//!
//! A [`ChannelCore`] owns the outbound queue, the listener table and the
//! closed flag. Implementations only differ in how bytes reach the peer and
//! come back; they feed inbound frames to [`ChannelCore::deliver`] from a
//! single reader task, which is what makes dispatch FIFO.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use tether_telemetry::{metric_inc, FRAMES_REJECTED};
use tether_types::{codec, Envelope, LinkError};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::{Listener, ListenerId};

pub(crate) struct ChannelCore {
    label: String,
    max_frame_bytes: usize,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener_id: AtomicU64,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl ChannelCore {
    pub(crate) fn new(
        label: impl Into<String>,
        max_frame_bytes: usize,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            label: label.into(),
            max_frame_bytes,
            outbound: Mutex::new(Some(outbound)),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            closed_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Track a background task so it is aborted on close.
    pub(crate) fn track(&self, handle: AbortHandle) {
        if self.is_closed() {
            handle.abort();
        } else {
            self.tasks.lock().push(handle);
        }
    }

    pub(crate) fn send(&self, envelope: &Envelope) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Transport(format!("channel {} is closed", self.label)));
        }

        let bytes = codec::encode(envelope)?;
        if bytes.len() > self.max_frame_bytes {
            return Err(LinkError::Serialization(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                bytes.len(),
                self.max_frame_bytes
            )));
        }

        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx
                .send(bytes)
                .map_err(|_| LinkError::Transport(format!("channel {} is closed", self.label))),
            None => Err(LinkError::Transport(format!("channel {} is closed", self.label))),
        }
    }

    /// Decode one inbound frame and hand it to every listener, in
    /// registration order.
    pub(crate) fn deliver(&self, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }

        let envelope = match codec::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %self.label, error = %e, "Rejected inbound frame");
                metric_inc!(FRAMES_REJECTED, &["decode"]);
                return;
            }
        };

        // Snapshot so listeners may register or remove listeners re-entrantly.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&envelope);
        }
    }

    pub(crate) fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        if !self.is_closed() {
            self.listeners.write().push((id, listener));
        }
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    pub(crate) fn close(&self) {
        let already_closed = self.closed_tx.send_replace(true);
        if already_closed {
            return;
        }

        debug!(channel = %self.label, "Channel closed");
        // Dropping the sender lets queued frames drain, then ends the peer's stream.
        self.outbound.lock().take();
        self.listeners.write().clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    pub(crate) async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
