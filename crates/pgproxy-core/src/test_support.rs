//! Deterministic driver for tests.
//!
//! [`ScriptedDriver`] honors the full [`PgDriver`] contract without a
//! backend: connects allocate sequential connection ids, queries and
//! executes replay scripted results, notifications and connection loss are
//! injected by the test. Every call is recorded for assertions.

use crate::driver::{
    ConnectParams, DriverError, DriverEvent, DriverEventSender, PgDriver, QueryBatch,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use pgproxy_commons::ids::ConnectionId;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One recorded driver invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Connect {
        host: String,
        user: String,
        password: String,
    },
    Disconnect {
        connection_id: ConnectionId,
        discard: bool,
    },
    Query {
        connection_id: ConnectionId,
        sql: String,
        record_count: usize,
    },
    More {
        connection_id: ConnectionId,
    },
    Execute {
        connection_id: ConnectionId,
        sql: String,
    },
    Listen {
        connection_id: ConnectionId,
        channel: String,
    },
}

struct LiveConnection {
    events: DriverEventSender,
    channels: Vec<String>,
}

#[derive(Default)]
struct ScriptState {
    next_connection: u64,
    live: HashMap<ConnectionId, LiveConnection>,
    query_results: VecDeque<Result<QueryBatch, DriverError>>,
    execute_results: VecDeque<Result<u64, DriverError>>,
    connect_failures: VecDeque<DriverError>,
    listen_failures: VecDeque<DriverError>,
    calls: Vec<DriverCall>,
}

#[derive(Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next query or moreQueryResults call.
    pub fn script_query(&self, batch: QueryBatch) {
        self.state.lock().query_results.push_back(Ok(batch));
    }

    pub fn script_query_error(&self, error: &str) {
        self.state
            .lock()
            .query_results
            .push_back(Err(DriverError::Backend(error.to_string())));
    }

    /// Queue the result of the next executeSql call.
    pub fn script_execute(&self, count: u64) {
        self.state.lock().execute_results.push_back(Ok(count));
    }

    pub fn fail_next_connect(&self, error: &str) {
        self.state
            .lock()
            .connect_failures
            .push_back(DriverError::Connect(error.to_string()));
    }

    pub fn fail_next_listen(&self, error: &str) {
        self.state
            .lock()
            .listen_failures
            .push_back(DriverError::Backend(error.to_string()));
    }

    /// Inject a NOTIFY. Returns how many live connections carried it.
    pub fn notify(&self, channel: &str, payload: &str) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for (connection_id, live) in &state.live {
            if live.channels.iter().any(|c| c == channel) {
                let _ = live.events.send(DriverEvent::Notification {
                    connection_id: connection_id.clone(),
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
                delivered += 1;
            }
        }
        delivered
    }

    /// Kill a live connection from the backend side.
    pub fn kill_connection(&self, connection_id: &ConnectionId, error: &str) {
        let mut state = self.state.lock();
        if let Some(live) = state.live.remove(connection_id) {
            let _ = live.events.send(DriverEvent::ConnectionLost {
                connection_id: connection_id.clone(),
                error: error.to_string(),
            });
        }
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of live connections LISTENing on a channel.
    pub fn listening_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|live| live.channels.iter().any(|c| c == channel))
            .count()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl PgDriver for ScriptedDriver {
    async fn connect(
        &self,
        params: ConnectParams,
        _timeout: Duration,
        events: DriverEventSender,
    ) -> Result<ConnectionId, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Connect {
            host: params.host.clone(),
            user: params.user.clone(),
            password: params.password.clone(),
        });
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        state.next_connection += 1;
        let connection_id = ConnectionId::new(format!("conn-{}", state.next_connection));
        state.live.insert(
            connection_id.clone(),
            LiveConnection {
                events,
                channels: Vec::new(),
            },
        );
        Ok(connection_id)
    }

    async fn disconnect(
        &self,
        connection_id: &ConnectionId,
        discard: bool,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Disconnect {
            connection_id: connection_id.clone(),
            discard,
        });
        state
            .live
            .remove(connection_id)
            .map(|_| ())
            .ok_or_else(|| DriverError::UnknownConnection(connection_id.clone()))
    }

    async fn query(
        &self,
        connection_id: &ConnectionId,
        sql: &str,
        record_count: usize,
    ) -> Result<QueryBatch, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Query {
            connection_id: connection_id.clone(),
            sql: sql.to_string(),
            record_count,
        });
        if !state.live.contains_key(connection_id) {
            return Err(DriverError::UnknownConnection(connection_id.clone()));
        }
        state
            .query_results
            .pop_front()
            .unwrap_or_else(|| Ok(QueryBatch::default()))
    }

    async fn more_query_results(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<QueryBatch, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::More {
            connection_id: connection_id.clone(),
        });
        if !state.live.contains_key(connection_id) {
            return Err(DriverError::UnknownConnection(connection_id.clone()));
        }
        state
            .query_results
            .pop_front()
            .unwrap_or_else(|| Ok(QueryBatch::default()))
    }

    async fn execute_sql(
        &self,
        connection_id: &ConnectionId,
        sql: &str,
    ) -> Result<u64, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Execute {
            connection_id: connection_id.clone(),
            sql: sql.to_string(),
        });
        if !state.live.contains_key(connection_id) {
            return Err(DriverError::UnknownConnection(connection_id.clone()));
        }
        state.execute_results.pop_front().unwrap_or(Ok(0))
    }

    async fn listen(
        &self,
        connection_id: &ConnectionId,
        channel: &str,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Listen {
            connection_id: connection_id.clone(),
            channel: channel.to_string(),
        });
        if let Some(error) = state.listen_failures.pop_front() {
            return Err(error);
        }
        match state.live.get_mut(connection_id) {
            Some(live) => {
                live.channels.push(channel.to_string());
                Ok(())
            }
            None => Err(DriverError::UnknownConnection(connection_id.clone())),
        }
    }
}
