//! Session authentication and credential remapping.
//!
//! Authentication is an injected predicate: the host decides what a session
//! id means. The predicate receives the current session state and returns a
//! possibly-updated one alongside the verdict, so hosts with a real session
//! model keep their hook; hosts without one return the state untouched.
//!
//! Credential remapping lets the proxy hide real backend credentials from
//! untrusted clients: the values a client sends in a connect request are
//! only lookup keys into host-configured tables.

use pgproxy_commons::request::ConnectRequest;
use std::collections::HashMap;
use std::sync::Arc;

/// Fixed response text for rejected or missing sessions.
pub const INVALID_SESSION: &str = "Invalid session";

/// Substituted when a remap table has no entry for the presented key.
pub const INVALID_CREDENTIAL: &str = "invalid";

/// Opaque session state threaded through the authenticate predicate. The
/// proxy never interprets it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState(pub serde_json::Value);

/// The injected authenticate predicate: (session state, session id) to
/// (updated state, accepted).
pub type AuthenticateFn = Arc<dyn Fn(SessionState, &str) -> (SessionState, bool) + Send + Sync>;

/// Predicate that accepts every session, leaving the state untouched.
pub fn allow_all() -> AuthenticateFn {
    Arc::new(|state, _session_id: &str| (state, true))
}

/// Credential lookup tables for connect requests. An absent table is
/// identity; a configured table is authoritative and maps missing keys to
/// [`INVALID_CREDENTIAL`] (port: 0), so a client can never smuggle an
/// unmapped credential through.
#[derive(Debug, Clone, Default)]
pub struct CredentialMaps {
    pub host: Option<HashMap<String, String>>,
    pub port: Option<HashMap<u16, u16>>,
    pub database: Option<HashMap<String, String>>,
    pub user: Option<HashMap<String, String>>,
    pub password: Option<HashMap<String, String>>,
}

impl CredentialMaps {
    pub fn remap(&self, request: &ConnectRequest) -> ConnectRequest {
        ConnectRequest {
            host: remap_string(&self.host, &request.host),
            port: remap_port(&self.port, request.port),
            database: remap_string(&self.database, &request.database),
            user: remap_string(&self.user, &request.user),
            password: remap_string(&self.password, &request.password),
        }
    }
}

fn remap_string(table: &Option<HashMap<String, String>>, key: &str) -> String {
    match table {
        None => key.to_string(),
        Some(map) => map
            .get(key)
            .cloned()
            .unwrap_or_else(|| INVALID_CREDENTIAL.to_string()),
    }
}

fn remap_port(table: &Option<HashMap<u16, u16>>, key: u16) -> u16 {
    match table {
        None => key,
        Some(map) => map.get(&key).copied().unwrap_or(0),
    }
}
