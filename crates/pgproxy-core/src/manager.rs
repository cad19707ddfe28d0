//! Connection manager: binds clients to backend connections and shares
//! long-lived LISTEN connections.
//!
//! The manager is pure bookkeeping. Every operation that needs driver I/O
//! returns a plan describing what the supervisor must do; the matching
//! completion is applied against current state when the driver comes back,
//! which is where racing WebSocket closes are caught.
//!
//! Sharing model: a LISTEN connection is keyed by (credential fingerprint,
//! channel). The fingerprint excludes the password, so clients presenting
//! the same host/port/database/user share one backend LISTEN. Non-listen
//! connections are strictly 1:1.

use log::warn;
use pgproxy_commons::ids::{ClientId, ConnectionId};
use pgproxy_commons::request::{ConnectRequest, Fingerprint};
use std::collections::HashMap;
use std::fmt::Write as _;

/// One shared LISTEN slot. The owner is the client whose connection was
/// promoted into the slot; later joiners only hold a mapping.
#[derive(Debug, Clone)]
pub struct SharedListen {
    pub owner: ClientId,
    pub connection_id: ConnectionId,
}

/// What the supervisor must do to honor a disconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectPlan {
    /// The client was the last reference: close the backend connection.
    CloseBackend { connection_id: ConnectionId },
    /// Others still reference the connection: only the mapping was dropped,
    /// synthesize the success response immediately.
    DropReference,
}

/// What the supervisor must do to honor a listen.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenPlan {
    /// A shared slot already exists: the client was rebound to it; release
    /// its former (1:1) connection and respond success immediately.
    JoinExisting { released: ConnectionId },
    /// The client's connection was promoted into a new shared slot: issue
    /// the backend LISTEN and answer when it completes.
    StartNew { connection_id: ConnectionId },
}

/// What the supervisor must do to honor an unlisten.
#[derive(Debug, Clone, PartialEq)]
pub enum UnlistenPlan {
    /// The client is the only reference to the shared connection: respond
    /// success immediately; the slot decays when the client disconnects.
    LastSharer,
    /// Others still share the connection: reconnect the client onto a fresh
    /// non-listen connection using its stored connect request.
    Reconnect { request: ConnectRequest },
}

#[derive(Default)]
pub struct ConnectionManager {
    /// ClientId -> (remapped connect request, raw request frame).
    connect_requests: HashMap<ClientId, (ConnectRequest, String)>,
    /// ClientId -> backend connection. Several clients may map to one
    /// connection when it backs a shared LISTEN.
    connection_ids: HashMap<ClientId, ConnectionId>,
    /// (fingerprint, channel) -> shared LISTEN slot.
    shared_listen: HashMap<(Fingerprint, String), SharedListen>,
    stopping: bool,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connect in flight. The raw frame is kept so the eventual
    /// response (and a later LISTEN) can be correlated.
    pub fn store_connect_request(
        &mut self,
        client_id: ClientId,
        request: ConnectRequest,
        raw: String,
    ) {
        self.connect_requests.insert(client_id, (request, raw));
    }

    /// Apply a successful driver connect. Returns false when the connect
    /// record is gone (the WebSocket closed while the connect was in
    /// flight); the caller must close the fresh connection again.
    pub fn complete_connect(&mut self, client_id: &ClientId, connection_id: ConnectionId) -> bool {
        if self.connect_requests.contains_key(client_id) {
            self.connection_ids.insert(client_id.clone(), connection_id);
            true
        } else {
            false
        }
    }

    /// Drop the connect record after a failed driver connect.
    pub fn fail_connect(&mut self, client_id: &ClientId) {
        self.connect_requests.remove(client_id);
    }

    pub fn connection_of(&self, client_id: &ClientId) -> Option<ConnectionId> {
        self.connection_ids.get(client_id).cloned()
    }

    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.connection_ids.contains_key(client_id)
    }

    /// Number of clients referencing a backend connection.
    fn refcount(&self, connection_id: &ConnectionId) -> usize {
        self.connection_ids
            .values()
            .filter(|c| *c == connection_id)
            .count()
    }

    /// All clients bound to a backend connection, in no particular order.
    pub fn clients_on(&self, connection_id: &ConnectionId) -> Vec<ClientId> {
        self.connection_ids
            .iter()
            .filter(|(_, c)| *c == connection_id)
            .map(|(client, _)| client.clone())
            .collect()
    }

    /// True iff the client has no connection or its connection does not back
    /// a shared LISTEN.
    pub fn is_non_listen_connection(&self, client_id: &ClientId) -> bool {
        match self.connection_ids.get(client_id) {
            None => true,
            Some(connection_id) => !self
                .shared_listen
                .values()
                .any(|slot| slot.connection_id == *connection_id),
        }
    }

    /// True iff the client's connection backs the shared LISTEN slot for the
    /// given channel.
    pub fn is_listening_on_channel(&self, client_id: &ClientId, channel: &str) -> bool {
        let Some(connection_id) = self.connection_ids.get(client_id) else {
            return false;
        };
        self.shared_listen
            .iter()
            .any(|((_, ch), slot)| ch == channel && slot.connection_id == *connection_id)
    }

    /// Client-requested disconnect. None when the client holds no
    /// connection.
    pub fn plan_disconnect(&mut self, client_id: &ClientId) -> Option<DisconnectPlan> {
        let connection_id = self.connection_ids.get(client_id).cloned()?;
        self.connection_ids.remove(client_id);
        self.connect_requests.remove(client_id);

        if self.refcount(&connection_id) == 0 {
            self.shared_listen
                .retain(|_, slot| slot.connection_id != connection_id);
            Some(DisconnectPlan::CloseBackend { connection_id })
        } else {
            Some(DisconnectPlan::DropReference)
        }
    }

    /// Internal teardown on WebSocket disconnect or forced destroy: always
    /// clears the connect record (so an in-flight connect completes stale)
    /// and disposes the installed connection per the sharing rules. Returns
    /// the backend connection to close, if this client was its last
    /// reference.
    pub fn plan_internal_disconnect(&mut self, client_id: &ClientId) -> Option<ConnectionId> {
        self.connect_requests.remove(client_id);
        let connection_id = self.connection_ids.remove(client_id)?;

        if self.refcount(&connection_id) == 0 {
            self.shared_listen
                .retain(|_, slot| slot.connection_id != connection_id);
            Some(connection_id)
        } else {
            None
        }
    }

    /// Client-requested listen. None when the client's connect record is
    /// missing (invariant breach; callers pre-check connectedness).
    pub fn plan_listen(&mut self, client_id: &ClientId, channel: &str) -> Option<ListenPlan> {
        let connection_id = self.connection_ids.get(client_id).cloned()?;
        let (request, _) = self.connect_requests.get(client_id)?;
        let key = (request.fingerprint(), channel.to_string());

        match self.shared_listen.get(&key) {
            Some(slot) => {
                let shared = slot.connection_id.clone();
                self.connection_ids.insert(client_id.clone(), shared);
                Some(ListenPlan::JoinExisting {
                    released: connection_id,
                })
            }
            None => {
                self.shared_listen.insert(
                    key,
                    SharedListen {
                        owner: client_id.clone(),
                        connection_id: connection_id.clone(),
                    },
                );
                Some(ListenPlan::StartNew { connection_id })
            }
        }
    }

    /// Roll back a shared slot after the backend LISTEN failed.
    pub fn fail_listen(&mut self, client_id: &ClientId, channel: &str) {
        if let Some((request, _)) = self.connect_requests.get(client_id) {
            let key = (request.fingerprint(), channel.to_string());
            self.shared_listen.remove(&key);
        }
    }

    /// Client-requested unlisten. None when the client holds no connection.
    pub fn plan_unlisten(&mut self, client_id: &ClientId, _channel: &str) -> Option<UnlistenPlan> {
        let connection_id = self.connection_ids.get(client_id)?;
        if self.refcount(connection_id) == 1 {
            Some(UnlistenPlan::LastSharer)
        } else {
            let (request, _) = self.connect_requests.get(client_id)?;
            Some(UnlistenPlan::Reconnect {
                request: request.clone(),
            })
        }
    }

    /// Apply the fresh connection of an unlisten reconnect: the client's
    /// reference to the shared connection is replaced, the slot itself stays
    /// for the remaining sharers.
    pub fn complete_unlisten(&mut self, client_id: &ClientId, connection_id: ConnectionId) {
        self.connection_ids.insert(client_id.clone(), connection_id);
    }

    /// Destroy a backend connection that died: every bound client loses its
    /// mappings, matching shared slots are removed. Returns the affected
    /// clients.
    pub fn connection_lost(&mut self, connection_id: &ConnectionId) -> Vec<ClientId> {
        let clients = self.clients_on(connection_id);
        for client in &clients {
            self.connection_ids.remove(client);
            self.connect_requests.remove(client);
        }
        self.shared_listen
            .retain(|_, slot| slot.connection_id != *connection_id);
        clients
    }

    /// Defensive cleanup when a client record is destroyed. Anything still
    /// present here points at a missed teardown.
    pub fn remove_client(&mut self, client_id: &ClientId) {
        let had_request = self.connect_requests.remove(client_id).is_some();
        let had_connection = self.connection_ids.remove(client_id).is_some();
        if had_request || had_connection {
            debug_assert!(false, "client {} destroyed with live manager state", client_id);
            warn!(
                "client {} destroyed with live manager state (request={}, connection={})",
                client_id, had_request, had_connection
            );
        }
    }

    pub fn set_stopping(&mut self) {
        self.stopping = true;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "connect_requests: {} connection_ids: {} shared_listen: {} stopping: {}",
            self.connect_requests.len(),
            self.connection_ids.len(),
            self.shared_listen.len(),
            self.stopping
        );
        for (client, connection) in &self.connection_ids {
            let _ = writeln!(out, "  {} -> {}", client, connection);
        }
        for ((fingerprint, channel), slot) in &self.shared_listen {
            let _ = writeln!(
                out,
                "  LISTEN {:?}/{} -> {} (owner {})",
                fingerprint, channel, slot.connection_id, slot.owner
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(user: &str) -> ConnectRequest {
        ConnectRequest {
            host: "h".to_string(),
            port: 5432,
            database: "d".to_string(),
            user: user.to_string(),
            password: "p".to_string(),
        }
    }

    fn connected(manager: &mut ConnectionManager, client: &str, conn: &str) -> ClientId {
        let client_id = ClientId::new(client);
        manager.store_connect_request(client_id.clone(), request("u"), "{}".to_string());
        assert!(manager.complete_connect(&client_id, ConnectionId::new(conn)));
        client_id
    }

    #[test]
    fn test_connect_then_disconnect_clears_everything() {
        let mut manager = ConnectionManager::new();
        let a = connected(&mut manager, "a", "c1");

        assert!(manager.is_connected(&a));
        let plan = manager.plan_disconnect(&a).unwrap();
        assert_eq!(
            plan,
            DisconnectPlan::CloseBackend {
                connection_id: ConnectionId::new("c1")
            }
        );
        assert!(!manager.is_connected(&a));
        assert!(manager.plan_disconnect(&a).is_none());
    }

    #[test]
    fn test_stale_connect_completion() {
        let mut manager = ConnectionManager::new();
        let a = ClientId::new("a");
        manager.store_connect_request(a.clone(), request("u"), "{}".to_string());
        // WebSocket closed while the driver connect was in flight
        assert!(manager.plan_internal_disconnect(&a).is_none());
        assert!(!manager.complete_connect(&a, ConnectionId::new("c1")));
        assert!(!manager.is_connected(&a));
    }

    #[test]
    fn test_listen_promotes_connection_into_shared_slot() {
        let mut manager = ConnectionManager::new();
        let a = connected(&mut manager, "a", "c1");

        assert!(manager.is_non_listen_connection(&a));
        let plan = manager.plan_listen(&a, "events").unwrap();
        assert_eq!(
            plan,
            ListenPlan::StartNew {
                connection_id: ConnectionId::new("c1")
            }
        );
        assert!(!manager.is_non_listen_connection(&a));
        assert!(manager.is_listening_on_channel(&a, "events"));
        assert!(!manager.is_listening_on_channel(&a, "other"));
    }

    #[test]
    fn test_second_listener_joins_and_releases_its_connection() {
        let mut manager = ConnectionManager::new();
        let a = connected(&mut manager, "a", "c1");
        let b = connected(&mut manager, "b", "c2");

        manager.plan_listen(&a, "events").unwrap();
        let plan = manager.plan_listen(&b, "events").unwrap();
        assert_eq!(
            plan,
            ListenPlan::JoinExisting {
                released: ConnectionId::new("c2")
            }
        );
        // both now share c1
        assert_eq!(manager.connection_of(&b), Some(ConnectionId::new("c1")));
        assert_eq!(manager.clients_on(&ConnectionId::new("c1")).len(), 2);
    }

    #[test]
    fn test_different_credentials_do_not_share() {
        let mut manager = ConnectionManager::new();
        let a = connected(&mut manager, "a", "c1");
        let b = ClientId::new("b");
        manager.store_connect_request(b.clone(), request("other"), "{}".to_string());
        assert!(manager.complete_connect(&b, ConnectionId::new("c2")));

        manager.plan_listen(&a, "events").unwrap();
        let plan = manager.plan_listen(&b, "events").unwrap();
        assert_eq!(
            plan,
            ListenPlan::StartNew {
                connection_id: ConnectionId::new("c2")
            }
        );
    }

    #[test]
    fn test_unlisten_with_other_sharers_reconnects() {
        let mut manager = ConnectionManager::new();
        let a = connected(&mut manager, "a", "c1");
        let b = connected(&mut manager, "b", "c2");
        manager.plan_listen(&a, "events").unwrap();
        manager.plan_listen(&b, "events").unwrap();

        let plan = manager.plan_unlisten(&a, "events").unwrap();
        assert!(matches!(plan, UnlistenPlan::Reconnect { .. }));

        manager.complete_unlisten(&a, ConnectionId::new("c3"));
        assert_eq!(manager.connection_of(&a), Some(ConnectionId::new("c3")));
        assert!(manager.is_non_listen_connection(&a));
        // the shared LISTEN survives for b
        assert!(manager.is_listening_on_channel(&b, "events"));
    }

    #[test]
    fn test_unlisten_as_sole_sharer_leaves_slot() {
        let mut manager = ConnectionManager::new();
        let a = connected(&mut manager, "a", "c1");
        manager.plan_listen(&a, "events").unwrap();

        let plan = manager.plan_unlisten(&a, "events").unwrap();
        assert_eq!(plan, UnlistenPlan::LastSharer);
        assert!(manager.is_listening_on_channel(&a, "events"));
    }

    #[test]
    fn test_shared_disconnect_refcounts() {
        let mut manager = ConnectionManager::new();
        let a = connected(&mut manager, "a", "c1");
        let b = connected(&mut manager, "b", "c2");
        manager.plan_listen(&a, "events").unwrap();
        manager.plan_listen(&b, "events").unwrap();

        // first leaver only drops its reference
        assert_eq!(
            manager.plan_disconnect(&b).unwrap(),
            DisconnectPlan::DropReference
        );
        // last leaver closes the backend connection and the slot
        assert_eq!(
            manager.plan_disconnect(&a).unwrap(),
            DisconnectPlan::CloseBackend {
                connection_id: ConnectionId::new("c1")
            }
        );
        assert!(!manager.is_listening_on_channel(&a, "events"));
    }

    #[test]
    fn test_connection_lost_fans_out_and_clears() {
        let mut manager = ConnectionManager::new();
        let a = connected(&mut manager, "a", "c1");
        let b = connected(&mut manager, "b", "c2");
        manager.plan_listen(&a, "events").unwrap();
        manager.plan_listen(&b, "events").unwrap();

        let mut affected = manager.connection_lost(&ConnectionId::new("c1"));
        affected.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(affected, vec![a.clone(), b.clone()]);
        assert!(!manager.is_connected(&a));
        assert!(!manager.is_connected(&b));
        assert!(!manager.is_listening_on_channel(&a, "events"));
    }

    #[test]
    fn test_failed_listen_rolls_back_slot() {
        let mut manager = ConnectionManager::new();
        let a = connected(&mut manager, "a", "c1");
        manager.plan_listen(&a, "events").unwrap();
        manager.fail_listen(&a, "events");
        assert!(manager.is_non_listen_connection(&a));
    }
}
