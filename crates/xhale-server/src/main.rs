//! # xhale-server
//!
//! Runs the XHale sensor session manager and exposes it over HTTP.
//!
//! This binary provides:
//! - REST API for scanning, connecting, sampling and usage durations
//! - OpenAPI documentation via Swagger UI
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development, with a simulated sensor
//! cargo run --package xhale-server --features mock-bluetooth
//!
//! # Production
//! XHALE_ENV=production ./xhale-server
//! ```
//!
//! `XHALE_CONFIG` overrides the configuration file path.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use xhale_core::transport::TransportEvents;
use xhale_core::{
    default_config_path, Config, JsonFileStore, ManagerSettings, SessionManager, Transport,
};
use xhale_server::api;
use xhale_server::logging;
use xhale_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::is_production())?;

    let config_path = std::env::var_os("XHALE_CONFIG").map_or_else(default_config_path, PathBuf::from);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;
    info!(config = %config_path.display(), "Starting xhale-server");

    let store = JsonFileStore::open(&config.store.data_dir)
        .await
        .with_context(|| format!("opening document store in {}", config.store.data_dir.display()))?;
    let (transport, events) = open_transport(&config).await?;

    let (session, manager) = SessionManager::spawn(
        transport,
        events,
        Arc::new(store),
        ManagerSettings::from(&config),
    );

    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .context("parsing server.bind_address")?;
    let app = api::create_router(AppState::new(config, session.clone()));

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping session manager");
    session.shutdown().await;
    manager.await.context("session manager task panicked")?;

    Ok(())
}

#[cfg(all(feature = "bluetooth", not(feature = "mock-bluetooth")))]
async fn open_transport(config: &Config) -> anyhow::Result<(Arc<dyn Transport>, TransportEvents)> {
    let (transport, events) = xhale_core::BluerTransport::new(config.bluetooth.adapter.as_deref())
        .await
        .context("opening Bluetooth adapter")?;
    let transport: Arc<dyn Transport> = transport;
    Ok((transport, events))
}

#[cfg(not(all(feature = "bluetooth", not(feature = "mock-bluetooth"))))]
#[allow(clippy::unused_async)]
async fn open_transport(_config: &Config) -> anyhow::Result<(Arc<dyn Transport>, TransportEvents)> {
    warn!("Using the simulated Bluetooth transport");
    let (transport, events) = xhale_core::MockTransport::demo(std::time::Duration::from_secs(1));
    let transport: Arc<dyn Transport> = transport;
    Ok((transport, events))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
