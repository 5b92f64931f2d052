//! # Tether Types
//!
//! The wire vocabulary shared by the host process and every satellite.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: every type that crosses the process boundary
//!   is defined here, so both sides agree on the shape by construction.
//! - **Explicit Discriminant**: an [`Envelope`] is always one of `request`,
//!   `response` or `event`, validated at decode time (see [`codec`]).
//! - **Results, not faults**: failures travel as [`WireError`] inside a
//!   response and surface locally as [`LinkError`].
//!
//! ## Wire Shape
//!
//! ```text
//! {id?: string, kind: "request"|"response"|"event",
//!  method?: string, topic?: string, payload: any, error?: {kind, message}}
//! ```

pub mod codec;
pub mod envelope;
pub mod errors;
pub mod id;
pub mod query;
pub mod topics;

pub use codec::{decode, encode, CodecError};
pub use envelope::{Envelope, EnvelopeKind};
pub use errors::{ErrorKind, LinkError, WireError};
pub use id::{CallId, PeerId};
pub use query::{QueryMode, QueryRequest, QueryResult, EXECUTE_QUERY};
pub use topics::{
    InvalidateQuery, RefChanged, RefChangedPayload, TaskProgress, TaskProgressPayload, TaskStart,
    TaskStartPayload, topic_label, Topic,
};

/// Current protocol version, checked during the connection handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum encoded envelope size accepted by framed transports (10 MiB).
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
