//! SQLite connection pool for the task source and the export history.

use crate::error::{ExportError, ExportResult};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::Duration;
use tasktrack_config::DatabaseConfig;
use tracing::{info, warn};

/// Opens the pool described by `config`, running migrations if enabled.
///
/// In-memory databases are pinned to a single long-lived connection, since
/// every SQLite connection to `:memory:` opens a distinct database.
pub async fn connect(config: &DatabaseConfig) -> ExportResult<SqlitePool> {
    info!("Connecting to SQLite database...");

    let in_memory = config.url.contains(":memory:");
    let mut options = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { config.max_connections })
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs));
    if in_memory {
        options = options.min_connections(1).idle_timeout(None).max_lifetime(None);
    }

    let pool = options.connect(&config.url).await.map_err(|e| {
        warn!("Failed to connect to database: {}", e);
        ExportError::Configuration(format!("failed to connect to {}: {}", config.url, e))
    })?;

    if config.run_migrations {
        run_migrations(&pool).await?;
    }

    info!("SQLite connection pool established");
    Ok(pool)
}

/// Applies the bundled schema migrations.
pub async fn run_migrations(pool: &SqlitePool) -> ExportResult<()> {
    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| ExportError::Configuration(format!("migration failed: {}", e)))?;
    info!("Database migrations completed");
    Ok(())
}

/// Connects to a fresh in-memory database with migrations applied.
pub async fn connect_in_memory() -> ExportResult<SqlitePool> {
    connect(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        run_migrations: true,
        ..DatabaseConfig::default()
    })
    .await
}
