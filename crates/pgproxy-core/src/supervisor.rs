//! Proxy supervisor: the single event loop owning all mutable state.
//!
//! Every stimulus — WebSocket events, decoded client frames, driver
//! completions, driver unsolicited events, timers — arrives as one
//! [`ProxyMsg`] and is processed to completion against current state before
//! the next. Driver I/O is never awaited inside a handler: the handler
//! spawns the call and the completion comes back as another message. That is
//! the whole concurrency story; nothing else mutates the client table or the
//! connection manager.

use crate::auth::INVALID_SESSION;
use crate::client::{
    Client, ALREADY_LISTENING, LISTENING, NOT_CONNECTED, NOT_LISTENING_ON_CHANNEL,
};
use crate::config::ProxyConfig;
use crate::driver::{
    ConnectParams, DriverError, DriverEvent, DriverEventSender, PgDriver, QueryBatch,
};
use crate::manager::{ConnectionManager, DisconnectPlan, ListenPlan, UnlistenPlan};
use log::{debug, info, warn};
use pgproxy_commons::ids::{ClientId, ConnectionId};
use pgproxy_commons::request::{self, ConnectRequest, RequestBody, RequestTag};
use pgproxy_commons::response;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Everything the supervisor reacts to.
pub enum ProxyMsg {
    // lifecycle
    Start,
    Stop,
    DelayedStop,
    ClientDestroyed {
        client_id: ClientId,
    },
    Tick,

    // WebSocket ingress
    Connected {
        client_id: ClientId,
        ip: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
    },
    Disconnected {
        client_id: ClientId,
    },
    Frame {
        client_id: ClientId,
        text: String,
    },
    SendFailed {
        client_id: ClientId,
        error: String,
    },

    // driver completions
    ConnectFinished {
        client_id: ClientId,
        tag: RequestTag,
        result: Result<ConnectionId, DriverError>,
    },
    DisconnectFinished {
        client_id: ClientId,
        tag: RequestTag,
        result: Result<(), DriverError>,
    },
    InternalDisconnectFinished {
        connection_id: ConnectionId,
        result: Result<(), DriverError>,
    },
    QueryFinished {
        client_id: ClientId,
        tag: RequestTag,
        result: Result<QueryBatch, DriverError>,
    },
    ExecuteFinished {
        client_id: ClientId,
        tag: RequestTag,
        result: Result<u64, DriverError>,
    },
    ListenFinished {
        client_id: ClientId,
        tag: RequestTag,
        channel: String,
        result: Result<(), DriverError>,
    },
    UnlistenConnectFinished {
        client_id: ClientId,
        tag: RequestTag,
        result: Result<ConnectionId, DriverError>,
    },

    // driver unsolicited
    Driver(DriverEvent),
}

/// Cloneable handle the ingress layer and the host hold.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<ProxyMsg>,
    stopping: Arc<AtomicBool>,
    stopped_rx: watch::Receiver<bool>,
    client_count: Arc<AtomicUsize>,
}

impl SupervisorHandle {
    pub fn post(&self, msg: ProxyMsg) {
        let _ = self.tx.send(msg);
    }

    /// True once Stop was accepted; new WebSocket upgrades are refused.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    /// Resolves when the supervisor finished its stop sequence.
    pub async fn stopped(&self) {
        let mut rx = self.stopped_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct Supervisor {
    config: ProxyConfig,
    driver: Arc<dyn PgDriver>,
    clients: HashMap<ClientId, Client>,
    manager: ConnectionManager,
    running: bool,
    stopping: bool,
    current_time: u64,
    idle_time: u64,
    session: crate::auth::SessionState,
    tx: mpsc::UnboundedSender<ProxyMsg>,
    driver_events_tx: DriverEventSender,
    stopping_flag: Arc<AtomicBool>,
    stopped_tx: watch::Sender<bool>,
    client_count: Arc<AtomicUsize>,
}

impl Supervisor {
    /// Spawn the supervisor loop (plus its ticker and driver event
    /// forwarder) and return the handle.
    pub fn spawn(config: ProxyConfig, driver: Arc<dyn PgDriver>) -> SupervisorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let stopping = Arc::new(AtomicBool::new(false));
        let client_count = Arc::new(AtomicUsize::new(0));

        let handle = SupervisorHandle {
            tx: tx.clone(),
            stopping: Arc::clone(&stopping),
            stopped_rx,
            client_count: Arc::clone(&client_count),
        };

        // unsolicited driver events fold into the message queue
        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if forward_tx.send(ProxyMsg::Driver(event)).is_err() {
                    break;
                }
            }
        });

        if let Some(interval) = config.tick_interval {
            let tick_tx = tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if tick_tx.send(ProxyMsg::Tick).is_err() {
                        break;
                    }
                }
            });
        }

        let supervisor = Supervisor {
            config,
            driver,
            clients: HashMap::new(),
            manager: ConnectionManager::new(),
            running: false,
            stopping: false,
            current_time: 0,
            idle_time: 0,
            session: Default::default(),
            tx: tx.clone(),
            driver_events_tx: events_tx,
            stopping_flag: stopping,
            stopped_tx,
            client_count,
        };
        tokio::spawn(supervisor.run(rx));

        let _ = tx.send(ProxyMsg::Start);
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ProxyMsg>) {
        while let Some(msg) = rx.recv().await {
            if !matches!(msg, ProxyMsg::Tick) {
                self.idle_time = 0;
            }
            if self.handle(msg) {
                break;
            }
        }
    }

    /// Process one message. Returns true when the supervisor reached
    /// Stopped and the loop must end.
    fn handle(&mut self, msg: ProxyMsg) -> bool {
        match msg {
            ProxyMsg::Start => {
                self.running = true;
                self.config.events.proxy_started();
            }
            ProxyMsg::Stop => self.handle_stop(),
            ProxyMsg::DelayedStop => return self.handle_delayed_stop(),
            ProxyMsg::ClientDestroyed { client_id } => return self.handle_destroyed(client_id),
            ProxyMsg::Tick => self.handle_tick(),

            ProxyMsg::Connected {
                client_id,
                ip,
                outbound,
            } => self.handle_connected(client_id, ip, outbound),
            ProxyMsg::Disconnected { client_id } => self.handle_disconnected(client_id),
            ProxyMsg::Frame { client_id, text } => self.handle_frame(client_id, text),
            ProxyMsg::SendFailed { client_id, error } => {
                self.config.events.send_failed(&client_id, &error);
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.poison(error);
                }
            }

            ProxyMsg::ConnectFinished {
                client_id,
                tag,
                result,
            } => self.handle_connect_finished(client_id, tag, result),
            ProxyMsg::DisconnectFinished {
                client_id,
                tag,
                result,
            } => match result {
                Ok(()) => self.respond(&client_id, response::success(&tag, &client_id)),
                Err(e) => self.respond_error(&client_id, &tag, &e.to_string()),
            },
            ProxyMsg::InternalDisconnectFinished {
                connection_id,
                result,
            } => {
                if let Err(e) = result {
                    self.config.events.error(&format!(
                        "internal disconnect of {} failed: {}",
                        connection_id, e
                    ));
                }
            }
            ProxyMsg::QueryFinished {
                client_id,
                tag,
                result,
            } => match result {
                Ok(batch) => self.respond(
                    &client_id,
                    response::success_with_records(&tag, &batch.records, &client_id),
                ),
                Err(e) => self.respond_error(&client_id, &tag, &e.to_string()),
            },
            ProxyMsg::ExecuteFinished {
                client_id,
                tag,
                result,
            } => match result {
                Ok(count) => self.respond(
                    &client_id,
                    response::success_with_count(&tag, count, &client_id),
                ),
                Err(e) => self.respond_error(&client_id, &tag, &e.to_string()),
            },
            ProxyMsg::ListenFinished {
                client_id,
                tag,
                channel,
                result,
            } => self.handle_listen_finished(client_id, tag, channel, result),
            ProxyMsg::UnlistenConnectFinished {
                client_id,
                tag,
                result,
            } => self.handle_unlisten_connected(client_id, tag, result),

            ProxyMsg::Driver(event) => self.handle_driver_event(event),
        }
        false
    }

    // ---- lifecycle -------------------------------------------------------

    fn handle_stop(&mut self) {
        if self.stopping {
            return;
        }
        info!("stop requested, {} client(s) live", self.clients.len());
        self.running = false;
        self.stopping = true;
        self.stopping_flag.store(true, Ordering::Relaxed);
        for client in self.clients.values_mut() {
            client.mark_stopped();
        }
        self.manager.set_stopping();

        let tx = self.tx.clone();
        let delay = self.config.delay_before_stop;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ProxyMsg::DelayedStop);
        });
    }

    fn handle_delayed_stop(&mut self) -> bool {
        if self.clients.is_empty() {
            return self.stopped();
        }
        let ids: Vec<ClientId> = self.clients.keys().cloned().collect();
        for client_id in ids {
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.mark_disconnected(self.current_time);
            }
            self.internal_disconnect(&client_id);
            let _ = self.tx.send(ProxyMsg::ClientDestroyed {
                client_id: client_id.clone(),
            });
        }
        false
    }

    fn handle_destroyed(&mut self, client_id: ClientId) -> bool {
        if self.clients.remove(&client_id).is_some() {
            self.manager.remove_client(&client_id);
            self.client_count
                .store(self.clients.len(), Ordering::Relaxed);
            self.config.events.client_destroyed(&client_id);
        }
        if self.clients.is_empty() && !self.running {
            return self.stopped();
        }
        false
    }

    fn stopped(&mut self) -> bool {
        if self.config.debug {
            self.config.events.state_dump(&self.dump());
        }
        self.config.events.proxy_stopped();
        let _ = self.stopped_tx.send(true);
        true
    }

    fn handle_tick(&mut self) {
        self.current_time += 1;
        self.idle_time += 1;

        if self.config.idle_dump_state_frequency > 0
            && self.idle_time >= self.config.idle_dump_state_frequency
        {
            self.config.events.state_dump(&self.dump());
            self.idle_time = 0;
        }

        let gc_after = self.config.gc_disconnected_after_secs;
        let now = self.current_time;
        let expired: Vec<ClientId> = self
            .clients
            .iter()
            .filter_map(|(id, client)| match client.disconnected_at {
                Some(at) if now.saturating_sub(at) >= gc_after => Some(id.clone()),
                _ => None,
            })
            .collect();
        for client_id in expired {
            debug!("garbage collecting disconnected client {}", client_id);
            let _ = self.tx.send(ProxyMsg::ClientDestroyed { client_id });
        }
    }

    // ---- WebSocket events ------------------------------------------------

    fn handle_connected(
        &mut self,
        client_id: ClientId,
        ip: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) {
        if self.stopping {
            info!("refusing client {} during stop", client_id);
            return;
        }
        info!("client connected: {} ({:?})", client_id, ip);
        self.clients
            .insert(client_id.clone(), Client::new(client_id, ip, outbound));
        self.client_count
            .store(self.clients.len(), Ordering::Relaxed);
    }

    fn handle_disconnected(&mut self, client_id: ClientId) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            debug!("disconnect for unknown client {}", client_id);
            return;
        };
        info!("client disconnected: {}", client_id);
        client.mark_disconnected(self.current_time);
        self.internal_disconnect(&client_id);
    }

    fn handle_frame(&mut self, client_id: ClientId, text: String) {
        if !self.clients.contains_key(&client_id) {
            warn!("frame from unknown client {}", client_id);
            return;
        }
        if self.stopping {
            info!("rejecting request from {} during stop", client_id);
            return;
        }

        let envelope = request::decode(&text);
        let tag = envelope.tag();
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_request = Some(text.clone());
        }

        // authenticate before anything touches state; a missing sessionId is
        // an invalid session
        let authenticated = match envelope.session_id.as_deref() {
            None => false,
            Some(session_id) => {
                let (session, ok) =
                    (self.config.authenticate)(self.session.clone(), session_id);
                self.session = session;
                ok
            }
        };
        if !authenticated {
            self.respond_error(&client_id, &tag, INVALID_SESSION);
            return;
        }

        // a poisoned client answers every request with its fatal error
        if let Some(fatal) = self
            .clients
            .get(&client_id)
            .and_then(|c| c.fatal_error.clone())
        {
            self.respond_error(&client_id, &tag, &fatal);
            return;
        }

        match envelope.body {
            RequestBody::Connect(connect) => {
                self.dispatch_connect(client_id, tag, connect, envelope.raw)
            }
            RequestBody::Disconnect { discard_connection } => {
                self.dispatch_disconnect(client_id, tag, discard_connection)
            }
            RequestBody::Query { sql, record_count } => {
                self.dispatch_query(client_id, tag, sql, record_count)
            }
            RequestBody::MoreQueryResults => self.dispatch_more(client_id, tag),
            RequestBody::ExecuteSql { sql } => self.dispatch_execute(client_id, tag, sql),
            RequestBody::Listen { channel } => {
                self.dispatch_listen(client_id, tag, channel, envelope.raw)
            }
            RequestBody::Unlisten { channel } => self.dispatch_unlisten(client_id, tag, channel),
            RequestBody::Unknown { detail } => self.respond_error(&client_id, &tag, &detail),
        }
    }

    // ---- request dispatch ------------------------------------------------

    fn dispatch_connect(
        &mut self,
        client_id: ClientId,
        tag: RequestTag,
        connect: ConnectRequest,
        raw: String,
    ) {
        let remapped = self.config.maps.remap(&connect);
        self.manager
            .store_connect_request(client_id.clone(), remapped.clone(), raw);

        let driver = Arc::clone(&self.driver);
        let tx = self.tx.clone();
        let events = self.driver_events_tx.clone();
        let timeout = self.config.pg_connect_timeout;
        let params = to_params(&remapped);
        let queue_key = client_id.clone();
        self.run_client_op(&queue_key, async move {
            let result = driver.connect(params, timeout, events).await;
            let _ = tx.send(ProxyMsg::ConnectFinished {
                client_id,
                tag,
                result,
            });
        });
    }

    fn dispatch_disconnect(&mut self, client_id: ClientId, tag: RequestTag, discard: bool) {
        if !self.manager.is_connected(&client_id) {
            self.respond_error(&client_id, &tag, NOT_CONNECTED);
            return;
        }
        match self.manager.plan_disconnect(&client_id) {
            Some(DisconnectPlan::CloseBackend { connection_id }) => {
                let driver = Arc::clone(&self.driver);
                let tx = self.tx.clone();
                let queue_key = client_id.clone();
                self.run_client_op(&queue_key, async move {
                    let result = driver.disconnect(&connection_id, discard).await;
                    let _ = tx.send(ProxyMsg::DisconnectFinished {
                        client_id,
                        tag,
                        result,
                    });
                });
            }
            Some(DisconnectPlan::DropReference) => {
                self.respond(&client_id, response::success(&tag, &client_id));
            }
            None => self.respond_error(&client_id, &tag, NOT_CONNECTED),
        }
    }

    fn dispatch_query(
        &mut self,
        client_id: ClientId,
        tag: RequestTag,
        sql: String,
        record_count: usize,
    ) {
        let Some(connection_id) = self.require_non_listen(&client_id, &tag) else {
            return;
        };
        let driver = Arc::clone(&self.driver);
        let tx = self.tx.clone();
        let queue_key = client_id.clone();
        self.run_client_op(&queue_key, async move {
            let result = driver.query(&connection_id, &sql, record_count).await;
            let _ = tx.send(ProxyMsg::QueryFinished {
                client_id,
                tag,
                result,
            });
        });
    }

    fn dispatch_more(&mut self, client_id: ClientId, tag: RequestTag) {
        let Some(connection_id) = self.require_non_listen(&client_id, &tag) else {
            return;
        };
        let driver = Arc::clone(&self.driver);
        let tx = self.tx.clone();
        let queue_key = client_id.clone();
        self.run_client_op(&queue_key, async move {
            let result = driver.more_query_results(&connection_id).await;
            let _ = tx.send(ProxyMsg::QueryFinished {
                client_id,
                tag,
                result,
            });
        });
    }

    fn dispatch_execute(&mut self, client_id: ClientId, tag: RequestTag, sql: String) {
        let Some(connection_id) = self.require_non_listen(&client_id, &tag) else {
            return;
        };
        let driver = Arc::clone(&self.driver);
        let tx = self.tx.clone();
        let queue_key = client_id.clone();
        self.run_client_op(&queue_key, async move {
            let result = driver.execute_sql(&connection_id, &sql).await;
            let _ = tx.send(ProxyMsg::ExecuteFinished {
                client_id,
                tag,
                result,
            });
        });
    }

    fn dispatch_listen(
        &mut self,
        client_id: ClientId,
        tag: RequestTag,
        channel: String,
        raw: String,
    ) {
        if !self.manager.is_connected(&client_id) {
            self.respond_error(&client_id, &tag, NOT_CONNECTED);
            return;
        }
        if !self.manager.is_non_listen_connection(&client_id) {
            self.respond_error(&client_id, &tag, ALREADY_LISTENING);
            return;
        }
        match self.manager.plan_listen(&client_id, &channel) {
            Some(ListenPlan::JoinExisting { released }) => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.listen_request = Some(raw);
                }
                self.respond(&client_id, response::success(&tag, &client_id));
                self.close_backend(released);
            }
            Some(ListenPlan::StartNew { connection_id }) => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.listen_request = Some(raw);
                }
                let driver = Arc::clone(&self.driver);
                let tx = self.tx.clone();
                let queue_key = client_id.clone();
                self.run_client_op(&queue_key, async move {
                    let result = driver.listen(&connection_id, &channel).await;
                    let _ = tx.send(ProxyMsg::ListenFinished {
                        client_id,
                        tag,
                        channel,
                        result,
                    });
                });
            }
            None => {
                // a connected client always has a connect record
                debug_assert!(false, "listen with no connect record for {}", client_id);
                self.config
                    .events
                    .fatal_error(&format!("listen with no connect record for {}", client_id));
                self.respond_error(&client_id, &tag, NOT_CONNECTED);
            }
        }
    }

    fn dispatch_unlisten(&mut self, client_id: ClientId, tag: RequestTag, channel: String) {
        if !self.manager.is_connected(&client_id) {
            self.respond_error(&client_id, &tag, NOT_CONNECTED);
            return;
        }
        if !self.manager.is_listening_on_channel(&client_id, &channel) {
            self.respond_error(&client_id, &tag, NOT_LISTENING_ON_CHANNEL);
            return;
        }
        match self.manager.plan_unlisten(&client_id, &channel) {
            Some(UnlistenPlan::LastSharer) => {
                self.respond(&client_id, response::success(&tag, &client_id));
            }
            Some(UnlistenPlan::Reconnect { request }) => {
                let driver = Arc::clone(&self.driver);
                let tx = self.tx.clone();
                let events = self.driver_events_tx.clone();
                let timeout = self.config.pg_connect_timeout;
                let params = to_params(&request);
                let queue_key = client_id.clone();
                self.run_client_op(&queue_key, async move {
                    let result = driver.connect(params, timeout, events).await;
                    let _ = tx.send(ProxyMsg::UnlistenConnectFinished {
                        client_id,
                        tag,
                        result,
                    });
                });
            }
            None => self.respond_error(&client_id, &tag, NOT_CONNECTED),
        }
    }

    // ---- driver completions ----------------------------------------------

    fn handle_connect_finished(
        &mut self,
        client_id: ClientId,
        tag: RequestTag,
        result: Result<ConnectionId, DriverError>,
    ) {
        match result {
            Ok(connection_id) => {
                if self
                    .manager
                    .complete_connect(&client_id, connection_id.clone())
                {
                    self.respond(&client_id, response::success(&tag, &client_id));
                } else {
                    // the WebSocket closed while the connect was in flight
                    debug!(
                        "connect for {} completed after teardown, closing {}",
                        client_id, connection_id
                    );
                    self.close_backend(connection_id);
                }
            }
            Err(e) => {
                self.manager.fail_connect(&client_id);
                self.respond_error(&client_id, &tag, &e.to_string());
            }
        }
    }

    fn handle_listen_finished(
        &mut self,
        client_id: ClientId,
        tag: RequestTag,
        channel: String,
        result: Result<(), DriverError>,
    ) {
        match result {
            Ok(()) => self.respond(&client_id, response::success(&tag, &client_id)),
            Err(e) => {
                self.manager.fail_listen(&client_id, &channel);
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.listen_request = None;
                }
                self.respond_error(&client_id, &tag, &e.to_string());
            }
        }
    }

    fn handle_unlisten_connected(
        &mut self,
        client_id: ClientId,
        tag: RequestTag,
        result: Result<ConnectionId, DriverError>,
    ) {
        match result {
            Ok(connection_id) => {
                // the client may have vanished while the reconnect ran
                if self.clients.contains_key(&client_id) && self.manager.is_connected(&client_id)
                {
                    self.manager
                        .complete_unlisten(&client_id, connection_id.clone());
                    if let Some(client) = self.clients.get_mut(&client_id) {
                        client.listen_request = None;
                    }
                    self.respond(&client_id, response::success(&tag, &client_id));
                } else {
                    debug!(
                        "unlisten reconnect for {} completed after teardown, closing {}",
                        client_id, connection_id
                    );
                    self.close_backend(connection_id);
                }
            }
            Err(e) => self.respond_error(&client_id, &tag, &e.to_string()),
        }
    }

    // ---- driver unsolicited ----------------------------------------------

    fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Notification {
                connection_id,
                channel,
                payload,
            } => {
                for client_id in self.manager.clients_on(&connection_id) {
                    let Some(client) = self.clients.get(&client_id) else {
                        continue;
                    };
                    let tag = client
                        .listen_request
                        .as_deref()
                        .map(request::tag_of)
                        .unwrap_or(RequestTag {
                            request_id: None,
                            func: Some("listen".to_string()),
                        });
                    let frame = response::unsolicited(&tag, "notification", &payload, &client_id);
                    client.send(self.config.events.as_ref(), frame);
                    self.config.events.listen_event(&client_id, &channel);
                }
            }
            DriverEvent::ConnectionLost {
                connection_id,
                error,
            } => {
                info!("connection lost: {} ({})", connection_id, error);
                for client_id in self.manager.connection_lost(&connection_id) {
                    let Some(client) = self.clients.get(&client_id) else {
                        continue;
                    };
                    let tag = RequestTag {
                        request_id: client
                            .last_request
                            .as_deref()
                            .map(request::tag_of)
                            .and_then(|t| t.request_id),
                        func: Some("connect".to_string()),
                    };
                    let frame =
                        response::unsolicited(&tag, "connectionLostError", &error, &client_id);
                    client.send(self.config.events.as_ref(), frame);
                }
            }
        }
    }

    // ---- helpers ---------------------------------------------------------

    /// Pre-checks shared by query, moreQueryResults and executeSql: the
    /// client must be connected and its connection must not back a LISTEN.
    fn require_non_listen(
        &mut self,
        client_id: &ClientId,
        tag: &RequestTag,
    ) -> Option<ConnectionId> {
        if !self.manager.is_connected(client_id) {
            self.respond_error(client_id, tag, NOT_CONNECTED);
            return None;
        }
        if !self.manager.is_non_listen_connection(client_id) {
            self.respond_error(client_id, tag, LISTENING);
            return None;
        }
        self.manager.connection_of(client_id)
    }

    /// Tear down a client's backend state (WebSocket gone or forced stop);
    /// errors are logged, never answered.
    fn internal_disconnect(&mut self, client_id: &ClientId) {
        if let Some(connection_id) = self.manager.plan_internal_disconnect(client_id) {
            self.close_backend(connection_id);
        }
    }

    /// Queue a driver operation behind the client's earlier ones so its
    /// responses come back in request order.
    fn run_client_op(
        &self,
        client_id: &ClientId,
        op: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        match self.clients.get(client_id) {
            Some(client) => client.run_op(op),
            None => {
                tokio::spawn(op);
            }
        }
    }

    fn close_backend(&self, connection_id: ConnectionId) {
        let driver = Arc::clone(&self.driver);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = driver.disconnect(&connection_id, true).await;
            let _ = tx.send(ProxyMsg::InternalDisconnectFinished {
                connection_id,
                result,
            });
        });
    }

    fn respond(&self, client_id: &ClientId, frame: String) {
        if let Some(client) = self.clients.get(client_id) {
            client.send(self.config.events.as_ref(), frame);
        }
    }

    fn respond_error(&self, client_id: &ClientId, tag: &RequestTag, message: &str) {
        self.respond(client_id, response::error(tag, message, client_id));
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "supervisor: running={} stopping={} time={} clients={}",
            self.running,
            self.stopping,
            self.current_time,
            self.clients.len()
        );
        for client in self.clients.values() {
            let _ = writeln!(out, "  {}", client.dump());
        }
        out.push_str(&self.manager.dump());
        out
    }
}

fn to_params(request: &ConnectRequest) -> ConnectParams {
    ConnectParams {
        host: request.host.clone(),
        port: request.port,
        database: request.database.clone(),
        user: request.user.clone(),
        password: request.password.clone(),
    }
}
