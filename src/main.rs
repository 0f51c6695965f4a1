use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use telemux::config::Config;
use telemux::server;
use telemux::transport;
use telemux::TelemuxEngine;

// ========================================
// MAIN ENTRY POINT
// ========================================

#[tokio::main]
async fn main() {
    let config = Config::global();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    let transport = match transport::select(&config.server.transport, &config.transport, config.commands.queue_capacity) {
        Ok(t) => t,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    let engine = match TelemuxEngine::new(config, transport) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start hub: {}", e);
            std::process::exit(1);
        }
    };

    info!("telemux v{} starting (transport: {})", env!("CARGO_PKG_VERSION"), engine.transport);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let shutdown_hub = engine.hub.clone();

    tokio::select! {
        res = server::start_server(engine, &addr) => {
            if let Err(e) = res {
                error!("Server on {} failed: {}", addr, e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    let _ = shutdown_hub.shutdown().await;
}
