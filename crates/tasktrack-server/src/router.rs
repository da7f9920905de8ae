//! Main application router.

use crate::controllers::{export_controller, gateway_controller, health_controller, mutation_controller};
use crate::middleware::logging_middleware;
use crate::state::AppState;
use axum::{extract::DefaultBodyLimit, middleware, routing::get, Router};
use tasktrack_config::ServerConfig;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

/// Creates the application router.
pub fn create_router(state: AppState, server_config: &ServerConfig) -> Router {
    let cors = if server_config.cors_enabled {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
    };

    let api_router = Router::new()
        .nest("/exports", export_controller::router())
        .layer(TimeoutLayer::new(server_config.request_timeout()));

    let router = Router::new()
        .merge(health_controller::router())
        .merge(gateway_controller::router())
        .nest("/api/v1", api_router)
        .nest("/internal", mutation_controller::router())
        .route("/", get(root))
        .with_state(state)
        .layer(DefaultBodyLimit::max(server_config.max_body_size))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(logging_middleware));

    info!("Router created with export endpoints and gateway at /ws");
    router
}

/// Root endpoint handler.
async fn root() -> &'static str {
    "TaskTrack Export API v1"
}
