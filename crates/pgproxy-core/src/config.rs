//! Runtime configuration of the proxy core.

use crate::auth::{allow_all, AuthenticateFn, CredentialMaps};
use crate::events::{LogEvents, ProxyEvents};
use std::sync::Arc;
use std::time::Duration;

/// Everything the supervisor needs at runtime. Built by the server binary
/// from its file configuration plus the host-injected predicate and sink.
#[derive(Clone)]
pub struct ProxyConfig {
    /// WebSocket endpoint path.
    pub path: String,
    /// Bound on one backend connect attempt.
    pub pg_connect_timeout: Duration,
    /// Delay between Stop and DelayedStop.
    pub delay_before_stop: Duration,
    /// Seconds a disconnected client lingers before GC destroys it.
    pub gc_disconnected_after_secs: u64,
    /// Ticks of inactivity before a state dump, 0 disables.
    pub idle_dump_state_frequency: u64,
    /// Dump state on stop and surface invariant breaches verbosely.
    pub debug: bool,
    /// Interval of the periodic tick; None lets tests drive ticks manually.
    pub tick_interval: Option<Duration>,
    /// Credential remap tables applied to connect requests.
    pub maps: CredentialMaps,
    /// Session authentication predicate.
    pub authenticate: AuthenticateFn,
    /// Host event sink.
    pub events: Arc<dyn ProxyEvents>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            path: "/pgproxy".to_string(),
            pg_connect_timeout: Duration::from_secs(10),
            delay_before_stop: Duration::from_secs(5),
            gc_disconnected_after_secs: 60,
            idle_dump_state_frequency: 300,
            debug: false,
            tick_interval: Some(Duration::from_secs(1)),
            maps: CredentialMaps::default(),
            authenticate: allow_all(),
            events: Arc::new(LogEvents),
        }
    }
}
