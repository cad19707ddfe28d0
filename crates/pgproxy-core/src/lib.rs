//! Proxy core: driver abstraction, connection manager, client state machine
//! and the supervisor event loop.
//!
//! All mutable proxy state lives behind the supervisor's message loop; the
//! other modules here are plain data structures and the asynchronous driver
//! seam the supervisor drives.

pub mod auth;
pub mod client;
pub mod config;
pub mod driver;
pub mod events;
pub mod manager;
pub mod supervisor;
pub mod test_support;

pub use auth::{AuthenticateFn, CredentialMaps, SessionState};
pub use config::ProxyConfig;
pub use driver::{ConnectParams, DriverError, DriverEvent, PgDriver, QueryBatch};
pub use events::{LogEvents, ProxyEvents};
pub use supervisor::{ProxyMsg, Supervisor, SupervisorHandle};
