//! Formatting of outbound frames.
//!
//! Responses are built by hand rather than through a serde structure: the
//! wire contract fixes the field order and uses an escaping scheme for
//! embedded record payloads that a standard JSON encoder does not produce.
//! Clients rely on both, so this module is the single place that knows the
//! layout.
//!
//! Every frame is one JSON object with the fields in this exact order:
//!
//! ```text
//! {"requestId": <n>, "type": "<func>", [unsolicited,] [success,] [<key>: ...,] "clientId": "<id>"}
//! ```

use crate::ids::ClientId;
use crate::request::RequestTag;

/// Substituted for `requestId` when the request carried none.
pub const MISSING_REQUEST_ID: &str = "Missing requestId";

/// Substituted for `type` when the request carried no `func`.
pub const MISSING_REQUEST_TYPE: &str = "Missing requestType";

/// Escape a payload string for embedding in a response frame.
///
/// Record values arrive from the driver as already-encoded strings, often
/// themselves JSON blobs carrying escaped quotes. A quote preceded by a run
/// of 7, 3, 1 or 0 backslashes becomes a run of 15, 7, 3 or 1 backslashes
/// followed by the quote (deepest run first, one left-to-right scan), after
/// which tabs and newlines are escaped. The 1-3-7-15 progression is what
/// lets nested blobs survive repeated wrapping and unwrap back to the exact
/// original bytes; it is a wire-compatibility contract.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    let mut backslashes = 0usize;

    for ch in value.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                let escaped = match backslashes {
                    7 => 15,
                    3 => 7,
                    1 => 3,
                    0 => 1,
                    n => 2 * n + 1,
                };
                for _ in 0..escaped {
                    out.push('\\');
                }
                out.push('"');
                backslashes = 0;
            }
            _ => {
                flush_backslashes(&mut out, &mut backslashes);
                match ch {
                    '\t' => out.push_str("\\t"),
                    '\n' => out.push_str("\\n"),
                    _ => out.push(ch),
                }
            }
        }
    }
    flush_backslashes(&mut out, &mut backslashes);
    out
}

fn flush_backslashes(out: &mut String, backslashes: &mut usize) {
    for _ in 0..*backslashes {
        out.push('\\');
    }
    *backslashes = 0;
}

/// `{"requestId":<n>,"type":"<func>"` with the missing-field substitutions.
fn header(tag: &RequestTag) -> String {
    let mut out = String::from("{\"requestId\":");
    match tag.request_id {
        Some(n) => out.push_str(&n.to_string()),
        None => {
            out.push('"');
            out.push_str(MISSING_REQUEST_ID);
            out.push('"');
        }
    }
    out.push_str(",\"type\":\"");
    match tag.func.as_deref() {
        Some(func) => out.push_str(&escape(func)),
        None => out.push_str(MISSING_REQUEST_TYPE),
    }
    out.push('"');
    out
}

fn footer(out: &mut String, client_id: &ClientId) {
    out.push_str(",\"clientId\":\"");
    out.push_str(&escape(client_id.as_str()));
    out.push_str("\"}");
}

/// Plain success response (connect, disconnect, listen, unlisten).
pub fn success(tag: &RequestTag, client_id: &ClientId) -> String {
    let mut out = header(tag);
    out.push_str(",\"success\":true");
    footer(&mut out, client_id);
    out
}

/// Success response carrying an affected-row count (executeSql).
pub fn success_with_count(tag: &RequestTag, count: u64, client_id: &ClientId) -> String {
    let mut out = header(tag);
    out.push_str(",\"success\":true,\"count\":");
    out.push_str(&count.to_string());
    footer(&mut out, client_id);
    out
}

/// Success response carrying records (query, moreQueryResults). Records are
/// escaped and wrapped verbatim; the proxy never re-decodes them.
pub fn success_with_records(tag: &RequestTag, records: &[String], client_id: &ClientId) -> String {
    let mut out = header(tag);
    out.push_str(",\"success\":true,\"records\":[");
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('"');
        out.push_str(&escape(record));
        out.push('"');
    }
    out.push(']');
    footer(&mut out, client_id);
    out
}

/// Error response keyed to the originating request.
pub fn error(tag: &RequestTag, message: &str, client_id: &ClientId) -> String {
    let mut out = header(tag);
    out.push_str(",\"success\":false,\"error\":\"");
    out.push_str(&escape(message));
    out.push('"');
    footer(&mut out, client_id);
    out
}

/// Unsolicited frame (LISTEN notification, connection-lost). Carries no
/// `success` field; `key` names the payload (`notification`,
/// `connectionLostError`).
pub fn unsolicited(tag: &RequestTag, key: &str, value: &str, client_id: &ClientId) -> String {
    let mut out = header(tag);
    out.push_str(",\"unsolicited\":true,\"");
    out.push_str(key);
    out.push_str("\":\"");
    out.push_str(&escape(value));
    out.push('"');
    footer(&mut out, client_id);
    out
}
