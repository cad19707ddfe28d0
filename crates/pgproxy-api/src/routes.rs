//! HTTP route wiring.

use crate::ws;
use actix_web::{web, HttpResponse, Responder};
use pgproxy_core::supervisor::SupervisorHandle;
use serde_json::json;

/// Register the WebSocket endpoint at the configured path plus the health
/// endpoint. The `SupervisorHandle` must already be registered as app data.
pub fn configure(cfg: &mut web::ServiceConfig, path: &str) {
    cfg.service(web::resource(path.to_string()).route(web::get().to(ws::websocket_handler)))
        .service(web::resource("/health").route(web::get().to(health)));
}

async fn health(handle: web::Data<SupervisorHandle>) -> impl Responder {
    let status = if handle.is_stopping() {
        "stopping"
    } else {
        "ok"
    };
    HttpResponse::Ok().json(json!({
        "status": status,
        "clients": handle.client_count(),
    }))
}
