//! swarmd entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use swarmd::api::{self, AppState};
use swarmd::{health, Config, StagingDirectoryUpdater, SwarmService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting swarmd {} at {} as {}",
        cfg.identifier,
        cfg.address,
        match &cfg.controller_address {
            Some(controller) => format!("node of {}", controller),
            None => "controller".to_string(),
        }
    );

    let cancel = CancellationToken::new();
    let updater = Arc::new(StagingDirectoryUpdater::new(cfg.staging_directory.clone()));
    let service = Arc::new(SwarmService::new(&cfg, updater, cancel.clone())?);

    // HTTP API
    let listener = TcpListener::bind(cfg.bind).await?;
    info!("Listening on {}", listener.local_addr()?);
    let router = api::router(AppState {
        service: Arc::clone(&service),
    });
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(listener, router, server_cancel).await {
            error!("HTTP server failed: {}", e);
        }
    });

    // Join the swarm
    if let Err(e) = service.initialize().await {
        error!("Unable to join the swarm: {}", e);
        cancel.cancel();
        let _ = server_handle.await;
        return Err(e.into());
    }

    // Health checks
    let health_handle = tokio::spawn(health::run(Arc::clone(&service)));

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    service.shutdown().await;
    let _ = health_handle.await;
    let _ = server_handle.await;

    info!("Shutdown complete.");
    Ok(())
}
