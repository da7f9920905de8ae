//! Export service facade.
//!
//! Wires the queue, executor, cache and gateway together and exposes the
//! operations the HTTP layer needs. Constructed once at startup and shared
//! by `Arc`.

use crate::artifact::{read_artifact, remove_artifact};
use crate::cache::{ExportCacheService, ExportHistoryStore, InvalidationReport, MemoryExportHistory, SqliteExportHistory};
use crate::db;
use crate::error::{ExportError, ExportResult};
use crate::executor::ExportExecutor;
use crate::filter::TaskFilter;
use crate::gateway::{ConnectionId, ConnectionRegistry, ExportGateway};
use crate::job::{ExportFormat, ExportPayload, Job, JobId, JobOptions, JobStatus, TASK_EXPORT_JOB};
use crate::queue::{CleanupReport, JobQueue, QueueStats, RecoveryReport};
use crate::source::{SqliteTaskSource, TaskSource};
use crate::state::JobStateManager;
use crate::store::{DurableStore, MemoryStore, RedisStore, StoreKeys};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tasktrack_config::{AppConfig, ExportConfig, StoreBackend};
use tasktrack_core::{Interface, TaskMutation};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

/// Key prefix used when no store configuration supplies one.
pub const DEFAULT_KEY_PREFIX: &str = "tasktrack:export";

/// Export submission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    /// `csv` or `json`.
    pub format: String,
    #[serde(default)]
    pub filter: TaskFilter,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub requester_id: String,
    /// Gateway connection that should receive this job's events.
    #[serde(default)]
    pub connection_id: Option<String>,
}

/// A completed export ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDownload {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Export operations used by the presentation layer.
#[async_trait]
pub trait ExportServiceInterface: Interface + Send + Sync {
    /// Validates and enqueues an export.
    async fn submit(&self, request: ExportRequest) -> ExportResult<Job>;

    /// Current state of a job.
    async fn job(&self, job_id: &JobId) -> ExportResult<Job>;

    /// Bytes of a completed job's artifact.
    async fn download(&self, job_id: &JobId) -> ExportResult<ExportDownload>;

    async fn pause(&self, job_id: &JobId) -> ExportResult<Job>;

    async fn resume(&self, job_id: &JobId) -> ExportResult<Job>;

    async fn cancel(&self, job_id: &JobId) -> ExportResult<Job>;

    /// Drops cached exports a task change may have made stale.
    async fn on_task_mutation(&self, mutation: TaskMutation) -> InvalidationReport;

    /// Removes finished jobs older than `max_age`.
    async fn cleanup(&self, max_age: Duration) -> ExportResult<CleanupReport>;

    async fn stats(&self) -> ExportResult<QueueStats>;

    /// Real-time gateway.
    fn gateway(&self) -> &ExportGateway;
}

/// The export subsystem.
pub struct ExportService {
    store: Arc<dyn DurableStore>,
    queue: Arc<JobQueue>,
    state: Arc<JobStateManager>,
    cache: Arc<ExportCacheService>,
    executor: Arc<ExportExecutor>,
    gateway: Arc<ExportGateway>,
    config: ExportConfig,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl ExportService {
    /// Builds the subsystem over explicit backends.
    pub fn new(
        store: Arc<dyn DurableStore>,
        history: Arc<dyn ExportHistoryStore>,
        source: Arc<dyn TaskSource>,
        key_prefix: &str,
        config: ExportConfig,
    ) -> Self {
        let keys = StoreKeys::new(key_prefix);
        let registry = Arc::new(ConnectionRegistry::new());
        let state = Arc::new(JobStateManager::new(
            store.clone(),
            keys.clone(),
            registry,
            config.gateway.clone(),
        ));
        let cache = Arc::new(ExportCacheService::new(
            store.clone(),
            keys,
            history,
            source.clone(),
            config.cache.clone(),
        ));
        let executor = Arc::new(ExportExecutor::new(
            source,
            cache.clone(),
            state.clone(),
            config.executor.clone(),
        ));
        let queue = Arc::new(JobQueue::new(store.clone(), state.clone(), config.queue.clone()));
        let gateway = Arc::new(ExportGateway::new(state.clone(), store.clone(), config.gateway.clone()));

        Self {
            store,
            queue,
            state,
            cache,
            executor,
            gateway,
            config,
            maintenance: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Process-local store and export history over `source`.
    pub fn in_memory(source: Arc<dyn TaskSource>, config: ExportConfig) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryExportHistory::new()),
            source,
            DEFAULT_KEY_PREFIX,
            config,
        )
    }

    /// Builds the subsystem from application configuration: tasks and
    /// export history in SQLite, queue and ephemeral cache in the
    /// configured store.
    pub async fn connect(app: &AppConfig) -> ExportResult<(Self, SqlitePool)> {
        let pool = db::connect(&app.database).await?;
        let store: Arc<dyn DurableStore> = match app.store.backend {
            StoreBackend::Redis => Arc::new(RedisStore::connect(&app.store).await?),
            StoreBackend::Memory => {
                warn!("Using the in-process store; export jobs will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };
        let service = Self::new(
            store,
            Arc::new(SqliteExportHistory::new(pool.clone())),
            Arc::new(SqliteTaskSource::new(pool.clone())),
            &app.store.key_prefix,
            app.export.clone(),
        );
        Ok((service, pool))
    }

    /// Registers the executor, recovers orphaned jobs, starts dispatching
    /// and the maintenance ticker.
    pub async fn initialize(&self) -> ExportResult<RecoveryReport> {
        self.queue.set_processor(self.executor.clone());
        let report = self.queue.initialize().await?;

        let mut slot = self.maintenance.lock();
        if slot.is_none() {
            *slot = Some(self.spawn_maintenance());
        }
        info!(
            recovered = report.recovered,
            skipped = report.skipped,
            concurrency_limit = self.config.queue.concurrency_limit,
            "Export service initialized"
        );
        Ok(report)
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let cache = self.cache.clone();
        let gateway = self.gateway.clone();
        let shutdown = self.shutdown.clone();
        let retention = self.config.queue.retention();
        let period = self.config.queue.maintenance_interval();
        let stall_period = self.config.gateway.stall_threshold().max(Duration::from_secs(1));

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                let mut stall_ticker = tokio::time::interval(stall_period);
                stall_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                stall_ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = cleanup_jobs(&queue, &cache, retention).await {
                                warn!(error = %e, "Export retention cleanup failed");
                            }
                            cache.purge_expired().await;
                        }
                        _ = stall_ticker.tick() => {
                            if let Err(e) = gateway.sweep_stalled().await {
                                warn!(error = %e, "Export stall sweep failed");
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("export_maintenance")),
        )
    }

    /// Stops the maintenance ticker and the dispatcher, waiting for running
    /// exports up to the configured timeout.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        self.queue.shutdown().await;
        info!("Export service stopped");
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<ExportCacheService> {
        &self.cache
    }

    pub fn state(&self) -> &Arc<JobStateManager> {
        &self.state
    }
}

/// Retention pass shared by [`ExportService::cleanup`] and the ticker.
async fn cleanup_jobs(queue: &JobQueue, cache: &ExportCacheService, max_age: Duration) -> ExportResult<CleanupReport> {
    let report = queue.cleanup(max_age).await?;
    for path in &report.partials {
        remove_artifact(path).await;
    }
    // Results still held by the cache go when their cache record does.
    for path in &report.results {
        if !cache.references(path).await {
            remove_artifact(path).await;
        }
    }
    Ok(report)
}

#[async_trait]
impl ExportServiceInterface for ExportService {
    async fn submit(&self, request: ExportRequest) -> ExportResult<Job> {
        let format: ExportFormat = request.format.parse()?;
        let options = JobOptions {
            priority: request.priority.unwrap_or(0),
            ..JobOptions::default()
        };
        let payload = ExportPayload {
            format,
            filter: request.filter,
            requester_id: request.requester_id,
        };

        let job_id = JobId::new();
        let connection = request
            .connection_id
            .filter(|c| !c.is_empty())
            .map(ConnectionId::from_string);
        // Bound before enqueue so `job-created` reaches the requester.
        if let Some(connection) = &connection {
            self.state.registry().bind(&job_id, connection);
        }

        let job = match self.queue.add_job(job_id.clone(), TASK_EXPORT_JOB, payload, options).await {
            Ok(job) => job,
            Err(e) => {
                self.state.registry().unbind(&job_id);
                return Err(e);
            }
        };
        if let Some(connection) = &connection {
            self.state.bind_connection(&job.id, connection).await?;
        }
        Ok(job)
    }

    async fn job(&self, job_id: &JobId) -> ExportResult<Job> {
        self.state.require(job_id).await
    }

    async fn download(&self, job_id: &JobId) -> ExportResult<ExportDownload> {
        let job = self.state.require(job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(ExportError::NotReady(format!("job {} is {}", job_id, job.status)));
        }
        let result = job
            .result
            .ok_or_else(|| ExportError::Gone(format!("job {} has no recorded artifact", job_id)))?;
        let bytes = match read_artifact(&result.artifact_path).await {
            Ok(bytes) => bytes,
            Err(ExportError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExportError::Gone(format!("artifact for job {} was removed", job_id)));
            }
            Err(e) => return Err(e),
        };
        Ok(ExportDownload {
            filename: result.filename,
            content_type: job.payload.format.content_type(),
            bytes,
        })
    }

    async fn pause(&self, job_id: &JobId) -> ExportResult<Job> {
        self.state.pause(job_id).await
    }

    async fn resume(&self, job_id: &JobId) -> ExportResult<Job> {
        self.state.resume(job_id).await
    }

    async fn cancel(&self, job_id: &JobId) -> ExportResult<Job> {
        self.state.cancel(job_id).await
    }

    async fn on_task_mutation(&self, mutation: TaskMutation) -> InvalidationReport {
        self.cache.invalidate_for_mutation(&mutation).await
    }

    async fn cleanup(&self, max_age: Duration) -> ExportResult<CleanupReport> {
        cleanup_jobs(&self.queue, &self.cache, max_age).await
    }

    async fn stats(&self) -> ExportResult<QueueStats> {
        self.queue.stats().await
    }

    fn gateway(&self) -> &ExportGateway {
        &self.gateway
    }
}
