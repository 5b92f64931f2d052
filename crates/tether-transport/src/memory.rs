//! In-process transport pair.
//!
//! Both endpoints still exchange encoded bytes, so everything that crosses
//! goes through the codec exactly as it would across a process boundary.

use async_trait::async_trait;
use std::sync::Arc;
use tether_types::{Envelope, LinkError, MAX_FRAME_BYTES};
use tokio::sync::mpsc;

use crate::channel::ChannelCore;
use crate::{Listener, ListenerId, Transport};

/// One end of an in-memory channel.
pub struct MemoryTransport {
    core: Arc<ChannelCore>,
}

/// Create two connected endpoints, `(host_side, satellite_side)`.
///
/// Must be called inside a Tokio runtime.
pub fn memory_pair() -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
    memory_pair_with_limit(MAX_FRAME_BYTES)
}

/// Like [`memory_pair`] with an explicit frame size limit.
pub fn memory_pair_with_limit(
    max_frame_bytes: usize,
) -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a = MemoryTransport::spawn("memory-a", max_frame_bytes, a_tx, b_rx);
    let b = MemoryTransport::spawn("memory-b", max_frame_bytes, b_tx, a_rx);
    (a, b)
}

impl MemoryTransport {
    fn spawn(
        label: &str,
        max_frame_bytes: usize,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Arc<Self> {
        let core = Arc::new(ChannelCore::new(label, max_frame_bytes, outbound));

        let reader_core = core.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                reader_core.deliver(&frame);
            }
            // Peer endpoint is gone.
            reader_core.close();
        });
        core.track(reader.abort_handle());

        Arc::new(Self { core })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.core.send(&envelope)
    }

    fn on_message(&self, listener: Listener) -> ListenerId {
        self.core.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.core.remove_listener(id)
    }

    fn close(&self) {
        self.core.close()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    async fn closed(&self) {
        self.core.closed().await
    }

    fn label(&self) -> &str {
        self.core.label()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.core.close();
    }
}
