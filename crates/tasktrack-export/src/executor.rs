//! Streaming export execution.
//!
//! A run counts the matching tasks, then pages through them in the
//! source's stable order, appending each encoded batch to the job's
//! artifact. Between batches it checks the job's status, so pause and
//! cancel take effect at batch boundaries. Checkpoints record how many
//! rows are fully written and the file size at that point; a resumed run
//! truncates the artifact back to that size and continues from there.

use crate::artifact::{artifact_exists, remove_artifact, ArtifactStore, ArtifactWriter};
use crate::cache::{CacheKey, ExportCacheService};
use crate::encoder::RecordEncoder;
use crate::error::{ExportError, ExportResult};
use crate::job::{ExportArtifact, Job, JobId, JobStatus};
use crate::queue::{JobProcessor, ProcessOutcome};
use crate::source::TaskSource;
use crate::state::JobStateManager;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tasktrack_config::ExecutorConfig;
use tracing::{debug, error, info, warn};

/// Where a streaming pass stopped.
enum StreamEnd {
    Finished { total_items: u64, file_size: u64 },
    Suspended(JobStatus),
}

/// Runs export jobs claimed by the queue.
pub struct ExportExecutor {
    source: Arc<dyn TaskSource>,
    cache: Arc<ExportCacheService>,
    state: Arc<JobStateManager>,
    artifacts: ArtifactStore,
    config: ExecutorConfig,
    /// Cache keys of finished fresh runs awaiting the queue's verdict.
    uncommitted: Mutex<HashMap<JobId, CacheKey>>,
}

impl ExportExecutor {
    pub fn new(
        source: Arc<dyn TaskSource>,
        cache: Arc<ExportCacheService>,
        state: Arc<JobStateManager>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            artifacts: ArtifactStore::new(&config.artifact_dir),
            source,
            cache,
            state,
            config,
            uncommitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Runs one job to completion, suspension or failure.
    pub async fn execute(&self, job: Job) -> ProcessOutcome {
        let stale = self.uncommitted.lock().remove(&job.id);
        if let Some(key) = stale {
            self.cache.abandon(&key).await;
        }
        let fresh = job.is_fresh();

        // Only fresh runs read or populate the cache. A resumed run's
        // artifact was started against data that may since have changed.
        let cache_key = if fresh { self.cache_key(&job).await } else { None };
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.lookup(key).await {
                info!(job_id = %job.id, source_job = %hit.job_id, "Serving export from cache");
                return ProcessOutcome::Completed(ExportArtifact {
                    filename: hit.filename,
                    artifact_path: hit.artifact_path,
                    file_size_bytes: hit.file_size_bytes,
                    total_items: hit.total_records,
                    from_cache: true,
                });
            }
            self.cache.begin(key, &job).await;
        }

        let path = job
            .checkpoint
            .temp_artifact_path
            .clone()
            .unwrap_or_else(|| default_artifact_path(&self.artifacts, &job));

        match self.stream(&job, &path).await {
            Ok(StreamEnd::Finished { total_items, file_size }) => {
                let artifact = ExportArtifact {
                    filename: artifact_filename(&job),
                    artifact_path: path,
                    file_size_bytes: file_size,
                    total_items,
                    from_cache: false,
                };
                if let Some(key) = cache_key {
                    self.uncommitted.lock().insert(job.id.clone(), key);
                }
                ProcessOutcome::Completed(artifact)
            }
            Ok(StreamEnd::Suspended(status)) => {
                if status != JobStatus::Paused {
                    remove_artifact(&path).await;
                }
                if let Some(key) = &cache_key {
                    self.cache.abandon(key).await;
                }
                ProcessOutcome::Suspended(status)
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Export run failed");
                remove_artifact(&path).await;
                if let Some(key) = &cache_key {
                    self.cache.abandon(key).await;
                }
                ProcessOutcome::Failed(e.to_string())
            }
        }
    }

    async fn cache_key(&self, job: &Job) -> Option<CacheKey> {
        if !self.cache.is_enabled() {
            return None;
        }
        match self.cache.key_for(&job.payload.filter, job.payload.format).await {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Could not compute cache key, exporting uncached");
                None
            }
        }
    }

    async fn stream(&self, job: &Job, path: &Path) -> ExportResult<StreamEnd> {
        let filter = &job.payload.filter;
        let encoder = RecordEncoder::new(job.payload.format);
        let batch_size = self.config.batch_size.max(1);
        let total = self.source.count(filter).await?;

        let (mut writer, mut processed) = self.open(job, path, &encoder).await?;
        debug!(job_id = %job.id, total, resume_from = processed, "Streaming export");
        self.state.report_progress(&job.id, processed, total.max(processed)).await?;

        let mut since_checkpoint = 0u64;
        let mut last_checkpoint = Instant::now();
        loop {
            match self.state.current_status(&job.id).await? {
                Some(JobStatus::Processing) => {}
                Some(JobStatus::Paused) => {
                    self.checkpoint(job, &mut writer, processed).await?;
                    info!(job_id = %job.id, processed, "Export suspended at checkpoint");
                    return Ok(StreamEnd::Suspended(JobStatus::Paused));
                }
                Some(other) => {
                    info!(job_id = %job.id, status = %other, processed, "Export stopped");
                    return Ok(StreamEnd::Suspended(other));
                }
                None => return Err(ExportError::NotFound(job.id.to_string())),
            }

            let batch = self.source.fetch_batch(filter, processed, batch_size).await?;
            if batch.is_empty() {
                break;
            }
            writer.write(&encoder.encode_batch(&batch, processed)?).await?;
            processed += batch.len() as u64;
            since_checkpoint += batch.len() as u64;
            self.state.report_progress(&job.id, processed, total.max(processed)).await?;

            if since_checkpoint >= self.config.checkpoint_items
                || last_checkpoint.elapsed() >= self.config.checkpoint_interval()
            {
                self.checkpoint(job, &mut writer, processed).await?;
                since_checkpoint = 0;
                last_checkpoint = Instant::now();
            }
        }

        writer.write(&encoder.footer(processed)).await?;
        let file_size = writer.finish().await?;
        debug!(job_id = %job.id, processed, file_size, "Export stream finished");
        Ok(StreamEnd::Finished {
            total_items: processed,
            file_size,
        })
    }

    /// Opens the artifact: fresh with a header, or truncated back to the
    /// last checkpoint.
    async fn open(&self, job: &Job, path: &Path, encoder: &RecordEncoder) -> ExportResult<(ArtifactWriter, u64)> {
        if !job.checkpoint.exists() {
            let mut writer = self.artifacts.create(path).await?;
            writer.write(&encoder.header()?).await?;
            return Ok((writer, 0));
        }

        if !artifact_exists(path).await {
            return Err(ExportError::Execution(format!(
                "checkpoint artifact {} is missing",
                path.display()
            )));
        }
        let checkpoint = &job.checkpoint;
        let writer = self
            .artifacts
            .reopen(path, checkpoint.last_checkpoint_file_size)
            .await?;
        info!(
            job_id = %job.id,
            items = checkpoint.last_checkpoint_items,
            file_size = checkpoint.last_checkpoint_file_size,
            "Resuming export from checkpoint"
        );
        Ok((writer, checkpoint.last_checkpoint_items))
    }

    async fn checkpoint(&self, job: &Job, writer: &mut ArtifactWriter, processed: u64) -> ExportResult<()> {
        writer.flush().await?;
        self.state
            .save_checkpoint(&job.id, processed, writer.size(), writer.path())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for ExportExecutor {
    async fn process(&self, job: Job) -> ProcessOutcome {
        self.execute(job).await
    }

    /// Publishes the artifact of a fresh run to the cache.
    async fn committed(&self, job: &Job, artifact: &ExportArtifact) {
        let key = self.uncommitted.lock().remove(&job.id);
        if let Some(key) = key {
            self.cache.store(&key, job, artifact).await;
        }
    }

    /// Drops the cache claim and, unless the job is paused and will resume
    /// into it, the artifact.
    async fn discarded(&self, job: &Job, artifact: &ExportArtifact) {
        let key = self.uncommitted.lock().remove(&job.id);
        if let Some(key) = key {
            self.cache.abandon(&key).await;
        }
        if artifact.from_cache {
            return;
        }
        match self.state.load(&job.id).await {
            Ok(Some(current)) if current.status == JobStatus::Paused => {}
            _ => {
                remove_artifact(&artifact.artifact_path).await;
            }
        }
    }
}

/// `tasks-export-{yyyymmdd-hhmmss}-{id8}.{ext}`
pub fn artifact_filename(job: &Job) -> String {
    format!(
        "tasks-export-{}-{}.{}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        job.id.short(),
        job.payload.format.extension()
    )
}

/// Path the executor writes a job's artifact to when no checkpoint names one.
pub fn default_artifact_path(store: &ArtifactStore, job: &Job) -> PathBuf {
    store.path_for(&job.id, job.payload.format)
}
