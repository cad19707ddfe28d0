// pgproxy server entrypoint
//!
//! The heavy lifting (proxy bootstrap, HTTP wiring, graceful shutdown)
//! lives in dedicated modules so this file remains a thin orchestrator.

mod config;
mod lifecycle;
mod logging;

use config::ServerConfig;
use log::{error, info};
use pgproxy_core::{auth, LogEvents};
use std::process;
use std::sync::Arc;

#[actix_web::main]
async fn main() {
    // Load configuration (fallback to defaults when config file missing)
    let config = match ServerConfig::from_file("config.toml") {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Warning: Failed to load config.toml: {}", e);
            eprintln!("Using defaults");
            ServerConfig::default()
        }
    };

    // Logging before any other side effects
    if let Err(e) = logging::init_logging(
        &config.logging.level,
        &config.logging.file_path,
        config.logging.log_to_console,
    ) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(-1);
    }

    let version = env!("CARGO_PKG_VERSION");
    info!("pgproxy v{}", version);
    info!(
        "Host: {}  Port: {}  Path: {}",
        config.server.host, config.server.ws_port, config.server.path
    );

    // Standalone deployments accept every session and log proxy events;
    // embedding hosts call lifecycle::bootstrap with their own hooks.
    let handle = lifecycle::bootstrap(&config, auth::allow_all(), Arc::new(LogEvents));

    // Exit codes are a host contract: 1 after a normal stop, -1 on a server
    // error.
    match lifecycle::run(&config, handle).await {
        Ok(()) => process::exit(1),
        Err(e) => {
            error!("Server error: {}", e);
            process::exit(-1);
        }
    }
}
