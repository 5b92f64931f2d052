//! Transport over any byte stream (Unix socket, TCP, duplex pipe).
//!
//! ## Frame Format
//!
//! ```text
//! ┌────────────┬──────────────────────┐
//! │   Length   │  JSON envelope bytes │
//! │ (4 bytes)  │  (variable length)   │
//! └────────────┴──────────────────────┘
//! ```
//!
//! Length is a big-endian `u32` counting only the envelope bytes. A frame
//! larger than the configured limit closes the channel, since the stream
//! cannot be resynchronized after skipping it.

use async_trait::async_trait;
use std::sync::Arc;
use tether_telemetry::{metric_inc, FRAMES_REJECTED};
use tether_types::{Envelope, LinkError, MAX_FRAME_BYTES};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::ChannelCore;
use crate::{Listener, ListenerId, Transport};

/// Framed transport driving a split byte stream with one reader task and
/// one writer task.
pub struct StreamTransport {
    core: Arc<ChannelCore>,
}

impl StreamTransport {
    /// Spawn reader and writer tasks for `io` with the default frame limit.
    pub fn spawn<IO>(io: IO, label: impl Into<String>) -> Arc<Self>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_with_limit(io, label, MAX_FRAME_BYTES)
    }

    pub fn spawn_with_limit<IO>(io: IO, label: impl Into<String>, max_frame_bytes: usize) -> Arc<Self>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(io);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let core = Arc::new(ChannelCore::new(label, max_frame_bytes, out_tx));

        // Writer: drains the queue in order; stops when the channel closes
        // and every queued frame has been written.
        let writer_core = core.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!(channel = %writer_core.label(), error = %e, "Write failed");
                    writer_core.close();
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_core = core.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, reader_core.max_frame_bytes()).await {
                    Ok(Some(frame)) => reader_core.deliver(&frame),
                    Ok(None) => {
                        debug!(channel = %reader_core.label(), "Peer closed stream");
                        break;
                    }
                    Err(FrameError::TooLarge(size)) => {
                        warn!(
                            channel = %reader_core.label(),
                            size,
                            max = reader_core.max_frame_bytes(),
                            "Inbound frame exceeds limit"
                        );
                        metric_inc!(FRAMES_REJECTED, &["oversize"]);
                        break;
                    }
                    Err(FrameError::Io(e)) => {
                        warn!(channel = %reader_core.label(), error = %e, "Read failed");
                        break;
                    }
                }
            }
            reader_core.close();
        });
        core.track(reader_task.abort_handle());

        Arc::new(Self { core })
    }
}

enum FrameError {
    TooLarge(usize),
    Io(std::io::Error),
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(frame.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` on clean EOF at a frame boundary.
async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_frame_bytes {
        return Err(FrameError::TooLarge(len));
    }

    let mut frame = vec![0u8; len];
    reader
        .read_exact(&mut frame)
        .await
        .map_err(FrameError::Io)?;
    Ok(Some(frame))
}

#[async_trait]
impl Transport for StreamTransport {
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

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.core.close();
    }
}
