//! Export subsystem configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the export subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Queue and dispatcher configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Export execution configuration.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Result cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Observer gateway configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Queue and dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of jobs executing at once.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// How long terminal job records are kept, in seconds.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Interval between retention/cache maintenance sweeps, in seconds.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Upper bound on an idle dispatcher sleep, in milliseconds.
    #[serde(default = "default_idle_recheck")]
    pub idle_recheck_ms: u64,

    /// First backoff after a store error, in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling, in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Time to wait for in-flight jobs on shutdown, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            retention_secs: default_retention(),
            maintenance_interval_secs: default_maintenance_interval(),
            idle_recheck_ms: default_idle_recheck(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl QueueConfig {
    /// Returns the retention period as Duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Returns the maintenance interval as Duration.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Returns the idle re-check interval as Duration.
    pub fn idle_recheck(&self) -> Duration {
        Duration::from_millis(self.idle_recheck_ms)
    }

    /// Returns the initial backoff as Duration.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Returns the backoff ceiling as Duration.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_concurrency_limit() -> usize {
    3
}

fn default_retention() -> u64 {
    86400 // 24 hours
}

fn default_maintenance_interval() -> u64 {
    3600
}

fn default_idle_recheck() -> u64 {
    30_000
}

fn default_initial_backoff() -> u64 {
    250
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Export execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Records fetched per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Persist a checkpoint after this many records.
    #[serde(default = "default_checkpoint_items")]
    pub checkpoint_items: u64,

    /// Persist a checkpoint after this many seconds, whichever comes first.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,

    /// Directory holding export artifacts.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            checkpoint_items: default_checkpoint_items(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

impl ExecutorConfig {
    /// Returns the checkpoint interval as Duration.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_checkpoint_items() -> u64 {
    1000
}

fn default_checkpoint_interval() -> u64 {
    5
}

fn default_artifact_dir() -> PathBuf {
    std::env::temp_dir().join("tasktrack-exports")
}

/// Result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable result caching.
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Lifetime of ephemeral-tier entries, in seconds.
    #[serde(default = "default_ephemeral_ttl")]
    pub ephemeral_ttl_secs: u64,

    /// Durable-tier lifetime for ordinary exports, in seconds.
    #[serde(default = "default_standard_ttl")]
    pub standard_ttl_secs: u64,

    /// Durable-tier lifetime for large exports, in seconds.
    #[serde(default = "default_extended_ttl")]
    pub extended_ttl_secs: u64,

    /// Record count above which an export is considered large.
    #[serde(default = "default_large_export_threshold")]
    pub large_export_threshold: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ephemeral_ttl_secs: default_ephemeral_ttl(),
            standard_ttl_secs: default_standard_ttl(),
            extended_ttl_secs: default_extended_ttl(),
            large_export_threshold: default_large_export_threshold(),
        }
    }
}

impl CacheConfig {
    /// Returns the ephemeral TTL as Duration.
    pub fn ephemeral_ttl(&self) -> Duration {
        Duration::from_secs(self.ephemeral_ttl_secs)
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_ephemeral_ttl() -> u64 {
    300
}

fn default_standard_ttl() -> u64 {
    900
}

fn default_extended_ttl() -> u64 {
    3600
}

fn default_large_export_threshold() -> u64 {
    1000
}

/// Observer gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// A processing job silent for longer than this is considered stalled.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_secs: u64,

    /// Minimum progress change, in percent, between two progress events.
    #[serde(default = "default_progress_step")]
    pub progress_step_percent: u8,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            stall_threshold_secs: default_stall_threshold(),
            progress_step_percent: default_progress_step(),
        }
    }
}

impl GatewayConfig {
    /// Returns the stall threshold as Duration.
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

fn default_stall_threshold() -> u64 {
    120
}

fn default_progress_step() -> u8 {
    5
}
