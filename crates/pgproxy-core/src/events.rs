//! Host event sink.
//!
//! The embedding host decides how proxy lifecycle events surface (its own
//! message types, metrics, plain logs). The proxy reports through this trait
//! and ships a log-backed default so standalone deployments need no wiring.

use log::{debug, error, info, warn};
use pgproxy_commons::ids::ClientId;

pub trait ProxyEvents: Send + Sync {
    /// The proxy accepted its Start message.
    fn proxy_started(&self) {
        info!("pgproxy started");
    }

    /// The proxy finished its stop sequence.
    fn proxy_stopped(&self) {
        info!("pgproxy stopped");
    }

    /// Unrecoverable condition (WebSocket listen failure, invariant breach).
    fn fatal_error(&self, context: &str) {
        error!("FATAL: {}", context);
    }

    /// Recoverable condition worth surfacing.
    fn error(&self, context: &str) {
        warn!("{}", context);
    }

    /// A frame was handed to the WebSocket layer for a client.
    fn frame_sent(&self, client_id: &ClientId, frame: &str) {
        debug!("sent to {}: {}", client_id, frame);
    }

    /// Sending to a client failed; the client is now poisoned.
    fn send_failed(&self, client_id: &ClientId, error: &str) {
        warn!("send to {} failed: {}", client_id, error);
    }

    /// A client record was removed.
    fn client_destroyed(&self, client_id: &ClientId) {
        debug!("client {} destroyed", client_id);
    }

    /// A LISTEN notification was forwarded to a client.
    fn listen_event(&self, client_id: &ClientId, channel: &str) {
        debug!("notification on {} delivered to {}", channel, client_id);
    }

    /// Readable dump of supervisor state (debug / idle timer).
    fn state_dump(&self, dump: &str) {
        debug!("state dump:\n{}", dump);
    }
}

/// Default sink: every event goes to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEvents;

impl ProxyEvents for LogEvents {}
