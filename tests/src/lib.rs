//! # Tether Test Suite
//!
//! Unified test crate containing:
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs       # SQLite executor, host + satellite setup
//! └── integration/      # End-to-end scenarios across host and satellites
//!     ├── scenarios.rs  # Query proxy, single-flight, pub/sub, timeouts, refs
//!     └── properties.rs # proptest checks
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p tether-tests
//! cargo test -p tether-tests integration::scenarios::
//! ```

pub mod fixtures;
pub mod integration;
