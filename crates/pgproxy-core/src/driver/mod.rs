//! Database driver abstraction.
//!
//! The supervisor never talks to PostgreSQL directly; it drives a
//! [`PgDriver`] trait object. The production implementation lives in
//! [`postgres`]; tests inject the deterministic driver from
//! `crate::test_support`.

pub mod postgres;

use async_trait::async_trait;
use pgproxy_commons::ids::ConnectionId;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use postgres::PostgresDriver;

/// Target and credentials of one backend connection, after remapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// One chunk of query results. `records` are already-encoded strings the
/// proxy wraps without re-decoding; `has_more` signals that
/// `more_query_results` will yield further records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryBatch {
    pub records: Vec<String>,
    pub has_more: bool,
}

/// Unsolicited events a live backend connection can raise.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A NOTIFY arrived on a channel this connection LISTENs on.
    Notification {
        connection_id: ConnectionId,
        channel: String,
        payload: String,
    },
    /// The backend connection died outside any request.
    ConnectionLost {
        connection_id: ConnectionId,
        error: String,
    },
}

/// Sender half for unsolicited driver events, handed in at connect time.
pub type DriverEventSender = mpsc::UnboundedSender<DriverEvent>;

#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("{0}")]
    Backend(String),
}

/// The driver operations the proxy needs. Every method is one backend
/// round-trip; commands against one connection are serialized by the
/// implementation so responses come back in request order.
#[async_trait]
pub trait PgDriver: Send + Sync {
    /// Open a backend connection. `events` receives this connection's
    /// unsolicited notifications and its connection-lost report.
    async fn connect(
        &self,
        params: ConnectParams,
        timeout: Duration,
        events: DriverEventSender,
    ) -> Result<ConnectionId, DriverError>;

    /// Close a backend connection. `discard` requests that the physical
    /// connection not be reused; drivers without pooling may ignore it.
    async fn disconnect(
        &self,
        connection_id: &ConnectionId,
        discard: bool,
    ) -> Result<(), DriverError>;

    /// Run a query and return the first `record_count` records.
    async fn query(
        &self,
        connection_id: &ConnectionId,
        sql: &str,
        record_count: usize,
    ) -> Result<QueryBatch, DriverError>;

    /// Fetch the next chunk of the most recent query on this connection.
    async fn more_query_results(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<QueryBatch, DriverError>;

    /// Run a statement and return the affected-row count.
    async fn execute_sql(
        &self,
        connection_id: &ConnectionId,
        sql: &str,
    ) -> Result<u64, DriverError>;

    /// Start LISTENing on a channel. Notifications arrive through the event
    /// sender registered at connect time.
    async fn listen(&self, connection_id: &ConnectionId, channel: &str)
        -> Result<(), DriverError>;
}
