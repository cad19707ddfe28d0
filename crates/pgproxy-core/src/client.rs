//! Per-client state.
//!
//! One record per connected WebSocket client. The record itself is plain
//! data; dispatch happens in the supervisor, which owns both the client
//! table and the connection manager.

use crate::events::ProxyEvents;
use futures_util::future::BoxFuture;
use pgproxy_commons::ids::ClientId;
use std::future::Future;
use tokio::sync::mpsc;

/// Canonical pre-check error strings. These are a wire contract; clients
/// match on them.
pub const NOT_CONNECTED: &str = "Operation NOT allowed since not connected";
pub const LISTENING: &str = "Operation NOT allowed since connection is used for listening";
pub const ALREADY_LISTENING: &str =
    "Operation NOT allowed since connection is ALREADY used for listening";
pub const NOT_LISTENING_ON_CHANNEL: &str =
    "Operation NOT allowed since connection is NOT listening to specified channel";

pub struct Client {
    pub client_id: ClientId,
    pub ip: Option<String>,
    /// True while live; false once a stop was initiated or the disconnect
    /// was recorded. A non-running client answers nothing.
    pub running: bool,
    /// Set on the first send failure; monotonic until the record dies.
    pub fatal_error: Option<String>,
    /// Supervisor time of the WebSocket disconnect; starts the GC countdown.
    pub disconnected_at: Option<u64>,
    /// Raw frame of the request that started the current LISTEN; unsolicited
    /// notifications are formatted against it.
    pub listen_request: Option<String>,
    /// Raw frame of the most recent request; connection-lost frames are
    /// keyed to it.
    pub last_request: Option<String>,
    outbound: mpsc::UnboundedSender<String>,
    ops: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl Client {
    pub fn new(
        client_id: ClientId,
        ip: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        // One runner per client executes its driver operations strictly in
        // dispatch order; responses for request N can never trail request
        // N+1's. Pending operations drain even after the record is dropped.
        let (ops, mut ops_rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            while let Some(op) = ops_rx.recv().await {
                op.await;
            }
        });
        Self {
            client_id,
            ip,
            running: true,
            fatal_error: None,
            disconnected_at: None,
            listen_request: None,
            last_request: None,
            outbound,
            ops,
        }
    }

    /// Queue a driver operation behind this client's earlier operations.
    pub fn run_op(&self, op: impl Future<Output = ()> + Send + 'static) {
        if let Err(rejected) = self.ops.send(Box::pin(op)) {
            tokio::spawn(rejected.0);
        }
    }

    /// Hand a frame to the WebSocket layer. No-op once the client stopped;
    /// the DB side still drains, only the responses are suppressed. Actual
    /// send failures come back asynchronously as SendFailed messages.
    pub fn send(&self, events: &dyn ProxyEvents, frame: String) {
        if !self.running {
            return;
        }
        events.frame_sent(&self.client_id, &frame);
        // a dropped receiver means the socket task is gone; the Disconnected
        // message it posted on exit handles the cleanup
        let _ = self.outbound.send(frame);
    }

    /// Record a send failure. First error wins.
    pub fn poison(&mut self, error: String) {
        if self.fatal_error.is_none() {
            self.fatal_error = Some(error);
        }
    }

    pub fn mark_stopped(&mut self) {
        self.running = false;
    }

    pub fn mark_disconnected(&mut self, now: u64) {
        self.running = false;
        if self.disconnected_at.is_none() {
            self.disconnected_at = Some(now);
        }
    }

    pub fn dump(&self) -> String {
        format!(
            "{} running={} fatal={:?} disconnected_at={:?} listening={}",
            self.client_id,
            self.running,
            self.fatal_error,
            self.disconnected_at,
            self.listen_request.is_some()
        )
    }
}
