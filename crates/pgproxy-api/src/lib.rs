//! WebSocket ingress and HTTP route wiring for pgproxy.

pub mod routes;
pub mod ws;
