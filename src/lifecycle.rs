//! Server lifecycle management helpers.
//!
//! Encapsulates the heavy lifting so `main.rs` stays a thin orchestrator:
//! assembling the proxy core, wiring the HTTP server, and coordinating
//! graceful shutdown.

use crate::config::ServerConfig;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use log::{info, warn};
use pgproxy_api::routes;
use pgproxy_core::driver::PostgresDriver;
use pgproxy_core::supervisor::{ProxyMsg, Supervisor, SupervisorHandle};
use pgproxy_core::{ProxyConfig, ProxyEvents};
use std::sync::Arc;
use std::time::Duration;

/// Build the proxy core and spawn the supervisor loop.
///
/// The authenticate predicate and the event sink default to the permissive
/// predicate and the log sink; an embedding host replaces them here.
pub fn bootstrap(
    config: &ServerConfig,
    authenticate: pgproxy_core::AuthenticateFn,
    events: Arc<dyn ProxyEvents>,
) -> SupervisorHandle {
    let proxy_config = ProxyConfig {
        path: config.server.path.clone(),
        pg_connect_timeout: Duration::from_secs(config.proxy.pg_connect_timeout_secs),
        delay_before_stop: Duration::from_secs(config.proxy.delay_before_stop_secs),
        gc_disconnected_after_secs: config.proxy.garbage_collect_disconnected_clients_after_secs,
        idle_dump_state_frequency: config.proxy.idle_dump_state_frequency_secs,
        debug: config.proxy.debug,
        tick_interval: Some(Duration::from_secs(1)),
        maps: config.credential_maps(),
        authenticate,
        events,
    };

    Supervisor::spawn(proxy_config, Arc::new(PostgresDriver::new()))
}

/// Start the HTTP server and manage graceful shutdown.
pub async fn run(config: &ServerConfig, handle: SupervisorHandle) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.ws_port);
    info!("Starting WebSocket server on {}", bind_addr);
    info!(
        "Endpoints: GET {} (WebSocket), GET /health",
        config.server.path
    );

    let path = config.server.path.clone();
    let app_handle = handle.clone();
    let mut server = HttpServer::new(move || {
        let path = path.clone();
        App::new()
            .app_data(web::Data::new(app_handle.clone()))
            .configure(move |cfg| routes::configure(cfg, &path))
    })
    .bind(&bind_addr)?;

    if config.server.workers > 0 {
        server = server.workers(config.server.workers);
    }
    let server = server.run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            // the listener died under us: this is the fatal path
            let error = match result {
                Ok(Ok(())) => "server exited unexpectedly".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };
            return Err(anyhow::anyhow!("server error: {}", error));
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
    }

    // drive the supervisor stop sequence and wait for Stopped, bounded by
    // the stop delay plus a margin for client teardown
    handle.post(ProxyMsg::Stop);
    let stop_budget = Duration::from_secs(config.proxy.delay_before_stop_secs + 5);
    if tokio::time::timeout(stop_budget, handle.stopped())
        .await
        .is_err()
    {
        warn!(
            "Supervisor did not stop within {}s, shutting down anyway",
            stop_budget.as_secs()
        );
    }

    server_handle.stop(true).await;
    info!("Server shutdown complete");
    Ok(())
}
