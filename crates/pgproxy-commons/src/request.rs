//! Decoding of inbound client frames.
//!
//! Every WebSocket text frame is one JSON object carrying at least `func`,
//! `requestId` and `sessionId`. Decoding is deliberately lenient: a missing
//! or malformed field never drops the frame, it produces an envelope the
//! responder can still answer (the response substitutes the literal
//! `"Missing requestId"` / `"Missing requestType"` markers).

use serde::Deserialize;
use serde_json::Value;

/// Credentials and target of a backend connect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Sharing key for LISTEN connections.
///
/// The password is intentionally excluded so clients that present the same
/// (host, port, database, user) can share one backend LISTEN connection.
pub type Fingerprint = (String, u16, String, String);

impl ConnectRequest {
    pub fn fingerprint(&self) -> Fingerprint {
        (
            self.host.clone(),
            self.port,
            self.database.clone(),
            self.user.clone(),
        )
    }
}

/// The decoded body of a client request, dispatched on `func`.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Connect(ConnectRequest),
    Disconnect { discard_connection: bool },
    Query { sql: String, record_count: usize },
    MoreQueryResults,
    ExecuteSql { sql: String },
    Listen { channel: String },
    Unlisten { channel: String },
    Unknown { detail: String },
}

/// The `requestId` and `func` of a request, kept so a response (possibly
/// emitted long after the request) can be correlated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestTag {
    pub request_id: Option<i64>,
    pub func: Option<String>,
}

/// A fully decoded inbound frame: correlation fields plus the typed body.
/// The raw text is carried verbatim because LISTEN bookkeeping stores it and
/// later responses are formatted against it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub request_id: Option<i64>,
    pub func: Option<String>,
    pub session_id: Option<String>,
    pub body: RequestBody,
    pub raw: String,
}

impl Envelope {
    pub fn tag(&self) -> RequestTag {
        RequestTag {
            request_id: self.request_id,
            func: self.func.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectPayload {
    discard_connection: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPayload {
    sql: String,
    record_count: usize,
}

#[derive(Debug, Deserialize)]
struct ExecuteSqlPayload {
    sql: String,
}

#[derive(Debug, Deserialize)]
struct ChannelPayload {
    channel: String,
}

/// Decode one frame. Never fails: malformed input decodes to
/// [`RequestBody::Unknown`] with a human-readable detail.
pub fn decode(raw: &str) -> Envelope {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return Envelope {
                request_id: None,
                func: None,
                session_id: None,
                body: RequestBody::Unknown {
                    detail: format!("Malformed JSON: {}", e),
                },
                raw: raw.to_string(),
            };
        }
    };

    let request_id = value.get("requestId").and_then(Value::as_i64);
    let func = value
        .get("func")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let session_id = value
        .get("sessionId")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let body = match func.as_deref() {
        Some("connect") => decode_payload(&value, RequestBody::Connect),
        Some("disconnect") => decode_payload(&value, |p: DisconnectPayload| {
            RequestBody::Disconnect {
                discard_connection: p.discard_connection,
            }
        }),
        Some("query") => decode_payload(&value, |p: QueryPayload| RequestBody::Query {
            sql: p.sql,
            record_count: p.record_count,
        }),
        Some("moreQueryResults") => RequestBody::MoreQueryResults,
        Some("executeSql") => decode_payload(&value, |p: ExecuteSqlPayload| {
            RequestBody::ExecuteSql { sql: p.sql }
        }),
        Some("listen") => decode_payload(&value, |p: ChannelPayload| RequestBody::Listen {
            channel: p.channel,
        }),
        Some("unlisten") => decode_payload(&value, |p: ChannelPayload| RequestBody::Unlisten {
            channel: p.channel,
        }),
        Some(other) => RequestBody::Unknown {
            detail: format!("Unknown requestType: {}", other),
        },
        None => RequestBody::Unknown {
            detail: "Missing requestType".to_string(),
        },
    };

    Envelope {
        request_id,
        func,
        session_id,
        body,
        raw: raw.to_string(),
    }
}

/// Extract only the correlation fields of a stored raw request. Used when a
/// response must be keyed to a request decoded earlier (LISTEN notifications,
/// connection-lost frames).
pub fn tag_of(raw: &str) -> RequestTag {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return RequestTag::default(),
    };
    RequestTag {
        request_id: value.get("requestId").and_then(Value::as_i64),
        func: value
            .get("func")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    }
}

fn decode_payload<P, F>(value: &Value, build: F) -> RequestBody
where
    P: for<'de> Deserialize<'de>,
    F: FnOnce(P) -> RequestBody,
{
    match serde_json::from_value::<P>(value.clone()) {
        Ok(payload) => build(payload),
        Err(e) => RequestBody::Unknown {
            detail: format!("Invalid request: {}", e),
        },
    }
}
