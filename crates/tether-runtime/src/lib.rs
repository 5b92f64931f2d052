//! # Tether Runtime
//!
//! Process-scoped contexts for both ends of the link.
//!
//! ## Wiring
//!
//! ```text
//!  HostContext                                SatelliteContext
//!  ├─ MethodRegistry ($handshake, RefWrite,   ├─ ConnectionManager ── Connector
//!  │   RefRead, ExecuteQuery)                 │     └─ on_connect: bus.attach
//!  ├─ RpcServer                               ├─ SatelliteBus
//!  ├─ HostBus ◀──── one channel per peer ───▶ ├─ RefMirror
//!  └─ RefStore                                └─ QueryProxy
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let host = HostContext::new(TetherConfig::from_env())?;
//! host.register_query_executor(executor)?;
//!
//! let satellite = SatelliteContext::new(Arc::new(host.connector()), TetherConfig::default())?;
//! let result = satellite.execute_query("SELECT 1", vec![], QueryMode::All).await?;
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod host;
pub mod satellite;

pub use config::{ConfigError, TetherConfig, TransportConfig};
#[cfg(unix)]
pub use connector::UnixConnector;
pub use connector::LocalConnector;
pub use error::RuntimeError;
pub use host::HostContext;
pub use satellite::SatelliteContext;
