//! # Tether Transport
//!
//! One ordered, bidirectional channel per host↔satellite pair. RPC, pub/sub
//! and reference sync all share it and are told apart by envelope kind and
//! topic.
//!
//! ## Guarantees
//!
//! - **FIFO**: envelopes are dispatched to listeners in the order the peer
//!   sent them. A single reader task per channel decodes and dispatches.
//! - **Non-blocking send**: [`Transport::send`] encodes synchronously and
//!   enqueues onto an unbounded queue. It never waits on the peer.
//! - **Validated inbound**: frames that fail decoding are logged, counted and
//!   dropped before any listener sees them.
//! - **Closure**: closing either end closes both, wakes [`Transport::closed`]
//!   waiters and drops all listeners.
//!
//! ## Implementations
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │ memory_pair()        │        │ StreamTransport      │
//! │ in-process, encoded  │        │ u32 BE length + JSON │
//! │ bytes over mpsc      │        │ over AsyncRead/Write │
//! └──────────────────────┘        └──────────────────────┘
//! ```

mod channel;
pub mod memory;
pub mod stream;

pub use memory::{memory_pair, memory_pair_with_limit, MemoryTransport};
pub use stream::StreamTransport;

use async_trait::async_trait;
use std::sync::Arc;
use tether_types::{Envelope, LinkError};

/// Callback invoked for every inbound envelope, on the channel's reader task.
///
/// Listeners must not block; anything long-running belongs on its own task.
pub type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Handle returned by [`Transport::on_message`] for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// An ordered message channel to one peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue an envelope for the peer.
    ///
    /// Fails with [`LinkError::Transport`] when the channel is closed and
    /// with [`LinkError::Serialization`] when the envelope cannot be encoded
    /// within the frame limit. Nothing is written in either case.
    fn send(&self, envelope: Envelope) -> Result<(), LinkError>;

    /// Register a listener for inbound envelopes.
    fn on_message(&self, listener: Listener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    /// Close the channel. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the channel is closed, by either side.
    async fn closed(&self);

    /// Short name used in log lines.
    fn label(&self) -> &str {
        "transport"
    }
}
