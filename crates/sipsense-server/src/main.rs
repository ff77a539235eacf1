//! # sipsense-server
//!
//! HTTP server for the sipsense smart water bottle client.
//!
//! This binary provides:
//! - REST API for scanning, connecting and calibrating the bottle
//! - Live hydration snapshots over server-sent events
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development (mock radio)
//! cargo run --package sipsense-server
//!
//! # On the device
//! SIPSENSE_ENV=production ./sipsense-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use sipsense_core::Config;
use sipsense_server::{api, logging, state};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sipsense-server");

    let config_path = std::env::var("SIPSENSE_CONFIG")
        .map_or_else(|_| Config::default_path(), PathBuf::from);
    if let Err(e) = state::ensure_config_file(&config_path) {
        warn!(error = %e, "Could not write default configuration, continuing with defaults");
    }
    let config = Config::load_layered(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    info!(path = %config_path.display(), "Configuration loaded");

    let radio = state::build_radio(&config).await?;
    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .context("invalid server bind address")?;

    let app_state = state::AppState::start(config, radio);
    let orchestrator = app_state.orchestrator.clone();
    let app = api::create_router(app_state.shared());

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown().await;
    info!("sipsense-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
