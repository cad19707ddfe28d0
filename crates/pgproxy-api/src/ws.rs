//! WebSocket ingress.
//!
//! One handler accepts the upgrade and spawns a per-connection task that
//! bridges the socket to the supervisor: inbound text frames become
//! supervisor messages, outbound frames arrive over a per-client channel,
//! and a heartbeat interval evicts silent peers. The task never touches
//! proxy state; everything flows through [`SupervisorHandle`].

use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_ws::{CloseCode, CloseReason, Message, MessageStream, Session};
use futures_util::StreamExt;
use log::{debug, info, warn};
use pgproxy_commons::ids::ClientId;
use pgproxy_core::supervisor::{ProxyMsg, SupervisorHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How often heartbeat pings are sent.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Establish a WebSocket connection on the configured proxy path.
pub async fn websocket_handler(
    req: HttpRequest,
    stream: web::Payload,
    handle: web::Data<SupervisorHandle>,
) -> Result<HttpResponse, Error> {
    if handle.is_stopping() {
        return Ok(HttpResponse::ServiceUnavailable().body("Proxy is shutting down"));
    }

    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    let client_id = ClientId::new(uuid::Uuid::new_v4().simple().to_string());
    let ip = req.peer_addr().map(|addr| addr.ip().to_string());
    info!("WebSocket connection established: {} ({:?})", client_id, ip);

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    handle.post(ProxyMsg::Connected {
        client_id: client_id.clone(),
        ip,
        outbound: outbound_tx,
    });

    let handle = handle.get_ref().clone();
    actix_web::rt::spawn(run_client(client_id, session, msg_stream, outbound_rx, handle));

    Ok(response)
}

/// Per-connection bridge loop.
async fn run_client(
    client_id: ClientId,
    mut session: Session,
    mut msg_stream: MessageStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    handle: SupervisorHandle,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut last_seen = Instant::now();

    let close_reason = loop {
        tokio::select! {
            biased;

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > CLIENT_TIMEOUT {
                    warn!("WebSocket client heartbeat failed, disconnecting: {}", client_id);
                    break Some(CloseReason {
                        code: CloseCode::Normal,
                        description: Some("Heartbeat timeout".into()),
                    });
                }
                if session.ping(b"").await.is_err() {
                    break None;
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        // a failed send poisons the client but the socket
                        // stays up; transient failures must not kill it
                        if let Err(e) = session.text(text).await {
                            handle.post(ProxyMsg::SendFailed {
                                client_id: client_id.clone(),
                                error: format!("Unable to send response to client: {}", e),
                            });
                        }
                    }
                    None => break None,
                }
            }

            msg = msg_stream.next() => {
                match msg {
                    Some(Ok(Message::Ping(bytes))) => {
                        last_seen = Instant::now();
                        if session.pong(&bytes).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        handle.post(ProxyMsg::Frame {
                            client_id: client_id.clone(),
                            text: text.to_string(),
                        });
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Binary messages not supported: {}", client_id);
                    }
                    Some(Ok(Message::Close(reason))) => {
                        info!("Client requested close: {} ({:?})", client_id, reason);
                        break reason;
                    }
                    Some(Ok(_)) => {
                        // Continuation, Nop
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket protocol error on {}: {}", client_id, e);
                        break None;
                    }
                    None => {
                        debug!("WebSocket stream ended: {}", client_id);
                        break None;
                    }
                }
            }
        }
    };

    let _ = session.close(close_reason).await;
    handle.post(ProxyMsg::Disconnected { client_id });
}
