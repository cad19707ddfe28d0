//! Shared types and wire protocol for pgproxy.
//!
//! Everything that both the proxy core and the WebSocket ingress need:
//! typed identifiers, request decoding and response formatting. This crate
//! has no async machinery on purpose.

pub mod ids;
pub mod request;
pub mod response;

pub use ids::{ClientId, ConnectionId};
pub use request::{ConnectRequest, Envelope, Fingerprint, RequestBody, RequestTag};
