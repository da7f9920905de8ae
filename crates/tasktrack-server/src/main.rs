//! # TaskTrack Server
//!
//! Loads configuration, connects the export subsystem to SQLite and the
//! durable store, serves HTTP and the gateway socket, and drains running
//! exports on shutdown.

use std::sync::Arc;
use tasktrack_config::{AppConfig, ConfigLoader, ObservabilityConfig};
use tasktrack_core::{TrackError, TrackResult};
use tasktrack_export::{register_metrics, ExportService};
use tasktrack_server::startup::{print_startup_info, shutdown_signal};
use tasktrack_server::telemetry::init_tracing;
use tasktrack_server::{create_router, AppState};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ConfigLoader::from_default_location() {
        Ok(loader) => loader.get().await,
        Err(e) => {
            init_tracing(&ObservabilityConfig::default());
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.observability);

    info!("Starting TaskTrack export server...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> TrackResult<()> {
    info!("Environment: {}", config.app.environment);
    info!(backend = ?config.store.backend, "Export store backend");

    if config.observability.metrics_enabled {
        register_metrics();
    }

    let (service, _pool) = ExportService::connect(&config).await?;
    let service = Arc::new(service);
    service.initialize().await?;

    let router = create_router(AppState::new(service.clone()), &config.server);

    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TrackError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    print_startup_info(&addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| TrackError::Internal(format!("HTTP server error: {}", e)));

    service.shutdown().await;
    served?;

    info!("Server shutdown complete");
    Ok(())
}
