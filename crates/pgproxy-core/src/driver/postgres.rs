//! tokio-postgres implementation of the driver seam.
//!
//! Each backend connection is one spawned command task owning the
//! `tokio_postgres::Client` plus one poll task draining the connection's
//! message stream. The command task serializes operations arriving over an
//! mpsc queue, which is what gives per-connection request ordering; the poll
//! task forwards NOTIFY payloads and reports connection death.

use super::{
    ConnectParams, DriverError, DriverEvent, DriverEventSender, PgDriver, QueryBatch,
};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use pgproxy_commons::ids::ConnectionId;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_postgres::{AsyncMessage, Client, NoTls, SimpleQueryMessage};
use uuid::Uuid;

enum Command {
    Query {
        sql: String,
        record_count: usize,
        reply: oneshot::Sender<Result<QueryBatch, DriverError>>,
    },
    More {
        reply: oneshot::Sender<Result<QueryBatch, DriverError>>,
    },
    Execute {
        sql: String,
        reply: oneshot::Sender<Result<u64, DriverError>>,
    },
    Listen {
        channel: String,
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), DriverError>>,
    },
}

type CommandSender = mpsc::UnboundedSender<Command>;

/// Driver backed by tokio-postgres over plain TCP.
#[derive(Default)]
pub struct PostgresDriver {
    connections: Arc<Mutex<HashMap<ConnectionId, CommandSender>>>,
}

impl PostgresDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, connection_id: &ConnectionId) -> Result<CommandSender, DriverError> {
        self.connections
            .lock()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| DriverError::UnknownConnection(connection_id.clone()))
    }
}

#[async_trait]
impl PgDriver for PostgresDriver {
    async fn connect(
        &self,
        params: ConnectParams,
        timeout: Duration,
        events: DriverEventSender,
    ) -> Result<ConnectionId, DriverError> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&params.host)
            .port(params.port)
            .dbname(&params.database)
            .user(&params.user)
            .password(&params.password);

        let (client, connection) = tokio::time::timeout(timeout, pg.connect(NoTls))
            .await
            .map_err(|_| DriverError::ConnectTimeout(timeout))?
            .map_err(|e| DriverError::Connect(e.to_string()))?;

        let connection_id = ConnectionId::new(Uuid::new_v4().simple().to_string());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.connections
            .lock()
            .insert(connection_id.clone(), command_tx);

        let registry = Arc::clone(&self.connections);
        let poll_id = connection_id.clone();
        tokio::spawn(async move {
            let mut connection = connection;
            loop {
                let message =
                    futures_util::future::poll_fn(|cx| connection.poll_message(cx)).await;
                match message {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        let _ = events.send(DriverEvent::Notification {
                            connection_id: poll_id.clone(),
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("backend connection {} lost: {}", poll_id, e);
                        registry.lock().remove(&poll_id);
                        let _ = events.send(DriverEvent::ConnectionLost {
                            connection_id: poll_id.clone(),
                            error: e.to_string(),
                        });
                        break;
                    }
                    None => {
                        // clean close after a driver-requested disconnect
                        debug!("backend connection {} closed", poll_id);
                        registry.lock().remove(&poll_id);
                        break;
                    }
                }
            }
        });

        tokio::spawn(run_connection(client, command_rx));

        debug!(
            "connected to {}:{}/{} as {} ({})",
            params.host, params.port, params.database, params.user, connection_id
        );
        Ok(connection_id)
    }

    async fn disconnect(
        &self,
        connection_id: &ConnectionId,
        _discard: bool,
    ) -> Result<(), DriverError> {
        // no pooling here: discard or not, the physical connection is closed
        let sender = self
            .connections
            .lock()
            .remove(connection_id)
            .ok_or_else(|| DriverError::UnknownConnection(connection_id.clone()))?;
        call(&sender, |reply| Command::Disconnect { reply }).await
    }

    async fn query(
        &self,
        connection_id: &ConnectionId,
        sql: &str,
        record_count: usize,
    ) -> Result<QueryBatch, DriverError> {
        let sender = self.sender(connection_id)?;
        let sql = sql.to_string();
        call(&sender, |reply| Command::Query {
            sql,
            record_count,
            reply,
        })
        .await
    }

    async fn more_query_results(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<QueryBatch, DriverError> {
        let sender = self.sender(connection_id)?;
        call(&sender, |reply| Command::More { reply }).await
    }

    async fn execute_sql(
        &self,
        connection_id: &ConnectionId,
        sql: &str,
    ) -> Result<u64, DriverError> {
        let sender = self.sender(connection_id)?;
        let sql = sql.to_string();
        call(&sender, |reply| Command::Execute { sql, reply }).await
    }

    async fn listen(
        &self,
        connection_id: &ConnectionId,
        channel: &str,
    ) -> Result<(), DriverError> {
        let sender = self.sender(connection_id)?;
        let channel = channel.to_string();
        call(&sender, |reply| Command::Listen { channel, reply }).await
    }
}

async fn call<T, F>(sender: &CommandSender, build: F) -> Result<T, DriverError>
where
    F: FnOnce(oneshot::Sender<Result<T, DriverError>>) -> Command,
{
    let (reply_tx, reply_rx) = oneshot::channel();
    sender
        .send(build(reply_tx))
        .map_err(|_| DriverError::Backend("connection task exited".to_string()))?;
    reply_rx
        .await
        .map_err(|_| DriverError::Backend("connection task exited".to_string()))?
}

/// Command loop for one backend connection. Holds the query result buffer so
/// `moreQueryResults` can drain it chunk by chunk.
async fn run_connection(client: Client, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut buffered: VecDeque<String> = VecDeque::new();
    let mut chunk = 0usize;

    while let Some(command) = commands.recv().await {
        match command {
            Command::Query {
                sql,
                record_count,
                reply,
            } => {
                chunk = record_count;
                let result = fetch_rows(&client, &sql).await.map(|rows| {
                    buffered = rows.into();
                    next_batch(&mut buffered, chunk)
                });
                let _ = reply.send(result);
            }
            Command::More { reply } => {
                let _ = reply.send(Ok(next_batch(&mut buffered, chunk)));
            }
            Command::Execute { sql, reply } => {
                let result = client
                    .execute(sql.as_str(), &[])
                    .await
                    .map_err(|e| DriverError::Backend(e.to_string()));
                let _ = reply.send(result);
            }
            Command::Listen { channel, reply } => {
                let statement = format!("LISTEN {}", quote_identifier(&channel));
                let result = client
                    .batch_execute(&statement)
                    .await
                    .map_err(|e| DriverError::Backend(e.to_string()));
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }
    // dropping the client closes the backend connection
}

async fn fetch_rows(client: &Client, sql: &str) -> Result<Vec<String>, DriverError> {
    let messages = client
        .simple_query(sql)
        .await
        .map_err(|e| DriverError::Backend(e.to_string()))?;

    let mut rows = Vec::new();
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            let mut columns = Vec::with_capacity(row.len());
            for (idx, column) in row.columns().iter().enumerate() {
                columns.push((column.name().to_string(), row.get(idx).map(str::to_string)));
            }
            rows.push(render_record(&columns));
        }
    }
    Ok(rows)
}

/// Render one row as a JSON object of column name to text value. The simple
/// query protocol already gives every value in text form.
fn render_record(columns: &[(String, Option<String>)]) -> String {
    let mut object = Map::new();
    for (name, value) in columns {
        let value = match value {
            Some(v) => Value::String(v.clone()),
            None => Value::Null,
        };
        object.insert(name.clone(), value);
    }
    Value::Object(object).to_string()
}

fn next_batch(buffered: &mut VecDeque<String>, chunk: usize) -> QueryBatch {
    let take = if chunk == 0 {
        buffered.len()
    } else {
        chunk.min(buffered.len())
    };
    let records = buffered.drain(..take).collect();
    QueryBatch {
        records,
        has_more: !buffered.is_empty(),
    }
}

fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}
