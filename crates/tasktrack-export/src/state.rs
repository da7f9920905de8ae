//! Job state transitions.
//!
//! [`JobStateManager`] is the only writer of job status after enqueue. Every
//! transition is a guarded write, so a transition that lost a race with
//! another writer is reported instead of clobbering it. Lifecycle events go
//! out to the job's bound connection as soon as the write lands.

use crate::artifact::remove_artifact;
use crate::error::{ExportError, ExportResult};
use crate::events::{ExportEvent, JobSnapshot};
use crate::gateway::{ConnectionId, ConnectionRegistry};
use crate::job::{field, fields, ts, ExportArtifact, Job, JobId, JobProgress, JobStatus};
use crate::store::{DurableStore, GuardedWrite, QueueOp, StoreKeys};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tasktrack_config::GatewayConfig;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

const CANCEL_ATTEMPTS: usize = 5;

/// Single authority for job status transitions.
pub struct JobStateManager {
    store: Arc<dyn DurableStore>,
    keys: StoreKeys,
    registry: Arc<ConnectionRegistry>,
    config: GatewayConfig,
    dispatch: Arc<Notify>,
    running: AsyncMutex<HashSet<JobId>>,
    progress_marks: Mutex<HashMap<JobId, u8>>,
}

impl JobStateManager {
    pub fn new(
        store: Arc<dyn DurableStore>,
        keys: StoreKeys,
        registry: Arc<ConnectionRegistry>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            keys,
            registry,
            config,
            dispatch: Arc::new(Notify::new()),
            running: AsyncMutex::new(HashSet::new()),
            progress_marks: Mutex::new(HashMap::new()),
        }
    }

    /// Signal that wakes the dispatcher when a job becomes pending.
    pub fn dispatch_signal(&self) -> Arc<Notify> {
        self.dispatch.clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Reads and decodes a job record.
    pub async fn load(&self, job_id: &JobId) -> ExportResult<Option<Job>> {
        let key = self.keys.job(job_id.as_str());
        let map = self.store.hget_all(&key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Job::from_fields(&key, &map).map(Some)
    }

    /// Like [`load`](Self::load), but a missing job is an error.
    pub async fn require(&self, job_id: &JobId) -> ExportResult<Job> {
        self.load(job_id)
            .await?
            .ok_or_else(|| ExportError::NotFound(job_id.to_string()))
    }

    /// Reads only the status field.
    pub async fn current_status(&self, job_id: &JobId) -> ExportResult<Option<JobStatus>> {
        let key = self.keys.job(job_id.as_str());
        match self.store.hget(&key, fields::STATUS).await? {
            Some(raw) if !raw.is_empty() => raw
                .parse()
                .map(Some)
                .map_err(|e: ExportError| ExportError::malformed(key, e.to_string())),
            _ => Ok(None),
        }
    }

    /// Broadcasts a freshly enqueued job.
    pub fn announce_created(&self, job: &Job) {
        self.registry.publish(
            &job.id,
            ExportEvent::JobCreated {
                job_id: job.id.clone(),
                priority: job.priority,
                format: job.payload.format,
            },
        );
    }

    /// Routes a job's events to `connection` and records the binding on the
    /// job so it survives a restart of this process.
    pub async fn bind_connection(&self, job_id: &JobId, connection: &ConnectionId) -> ExportResult<bool> {
        let write = GuardedWrite::expecting(self.keys.job(job_id.as_str()), &JobStatus::ALL)
            .fields(vec![field(fields::CONNECTION_ID, connection)]);
        let applied = self.store.guarded_write(&write).await?;
        if applied {
            self.registry.bind(job_id, connection);
        }
        Ok(applied)
    }

    /// Persists progress of a processing job. A `progress` event goes out on
    /// the first report, on reaching 100%, and whenever the percentage has
    /// advanced by at least the configured step.
    pub async fn report_progress(&self, job_id: &JobId, processed: u64, total: u64) -> ExportResult<bool> {
        let write = GuardedWrite::expecting(self.keys.job(job_id.as_str()), &[JobStatus::Processing]).fields(vec![
            field(fields::PROCESSED_ITEMS, processed),
            field(fields::TOTAL_ITEMS, total),
            field(fields::UPDATED_AT, ts(Utc::now())),
        ]);
        if !self.store.guarded_write(&write).await? {
            return Ok(false);
        }

        let percent = JobProgress {
            processed_items: processed,
            total_items: total,
        }
        .percent();
        let emit = {
            let mut marks = self.progress_marks.lock();
            let due = match marks.get(job_id) {
                None => true,
                Some(&last) => {
                    (percent >= 100 && last < 100)
                        || percent >= last.saturating_add(self.config.progress_step_percent.max(1))
                }
            };
            if due {
                marks.insert(job_id.clone(), percent);
            }
            due
        };
        if emit {
            self.registry.publish(
                job_id,
                ExportEvent::Progress {
                    job_id: job_id.clone(),
                    status: JobStatus::Processing,
                    processed_items: processed,
                    total_items: total,
                    percent,
                },
            );
        }
        Ok(true)
    }

    /// Persists a resumable checkpoint. `processed` rows are fully contained
    /// in the first `file_size` bytes of `artifact`.
    pub async fn save_checkpoint(
        &self,
        job_id: &JobId,
        processed: u64,
        file_size: u64,
        artifact: &Path,
    ) -> ExportResult<bool> {
        let write = GuardedWrite::expecting(
            self.keys.job(job_id.as_str()),
            &[JobStatus::Processing, JobStatus::Paused],
        )
        .fields(vec![
            field(fields::PROCESSED_ITEMS, processed),
            field(fields::LAST_CHECKPOINT_ITEMS, processed),
            field(fields::LAST_CHECKPOINT_FILE_SIZE, file_size),
            field(fields::TEMP_ARTIFACT_PATH, artifact.to_string_lossy()),
            field(fields::UPDATED_AT, ts(Utc::now())),
        ]);
        let applied = self.store.guarded_write(&write).await?;
        if applied {
            debug!(job_id = %job_id, processed, file_size, "Checkpoint saved");
        }
        Ok(applied)
    }

    /// processing → paused. The run notices at its next batch boundary.
    pub async fn pause(&self, job_id: &JobId) -> ExportResult<Job> {
        let now = ts(Utc::now());
        let write = GuardedWrite::expecting(self.keys.job(job_id.as_str()), &[JobStatus::Processing]).fields(vec![
            field(fields::STATUS, JobStatus::Paused),
            field(fields::PAUSED_AT, &now),
            field(fields::UPDATED_AT, &now),
        ]);
        if !self.store.guarded_write(&write).await? {
            return Err(self.rejected(job_id, JobStatus::Paused).await);
        }

        let job = self.require(job_id).await?;
        info!(job_id = %job_id, processed = job.progress.processed_items, "Export paused");
        self.registry.publish(
            job_id,
            ExportEvent::Paused {
                job_id: job_id.clone(),
                processed_items: job.progress.processed_items,
            },
        );
        Ok(job)
    }

    /// paused → processing when the paused run is still alive in this
    /// process, otherwise paused → pending and back into the queue.
    pub async fn resume(&self, job_id: &JobId) -> ExportResult<Job> {
        let job = self.require(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(ExportError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Processing,
            });
        }

        let key = self.keys.job(job_id.as_str());
        let now = ts(Utc::now());
        let running = self.running.lock().await;
        let applied = if running.contains(job_id) {
            let write = GuardedWrite::expecting(&key, &[JobStatus::Paused]).fields(vec![
                field(fields::STATUS, JobStatus::Processing),
                field(fields::UPDATED_AT, &now),
            ]);
            self.store.guarded_write(&write).await?
        } else {
            let write = GuardedWrite::expecting(&key, &[JobStatus::Paused])
                .fields(vec![
                    field(fields::STATUS, JobStatus::Pending),
                    field(fields::UPDATED_AT, &now),
                ])
                .queue(QueueOp::Add {
                    key: self.keys.pending_queue(),
                    member: job_id.to_string(),
                    score: job.dispatch_score(),
                });
            let applied = self.store.guarded_write(&write).await?;
            if applied {
                self.dispatch.notify_one();
            }
            applied
        };
        drop(running);

        if !applied {
            return Err(self.rejected(job_id, JobStatus::Processing).await);
        }
        let job = self.require(job_id).await?;
        info!(job_id = %job_id, status = %job.status, "Export resumed");
        self.registry.publish(job_id, ExportEvent::Status { job: JobSnapshot::from(&job) });
        Ok(job)
    }

    /// pending | processing | paused → cancelled.
    ///
    /// A pending job leaves the queue; a paused job's partial artifact is
    /// deleted here. A processing run deletes its own artifact when it
    /// notices the cancellation.
    pub async fn cancel(&self, job_id: &JobId) -> ExportResult<Job> {
        for _ in 0..CANCEL_ATTEMPTS {
            let mut job = self.require(job_id).await?;
            if job.status.is_terminal() {
                return Err(ExportError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: job.status,
                    to: JobStatus::Cancelled,
                });
            }

            let now = Utc::now();
            let queue_op = if job.status == JobStatus::Pending {
                QueueOp::Remove {
                    key: self.keys.pending_queue(),
                    member: job_id.to_string(),
                }
            } else {
                QueueOp::None
            };
            let write = GuardedWrite::expecting(self.keys.job(job_id.as_str()), &[job.status])
                .fields(vec![
                    field(fields::STATUS, JobStatus::Cancelled),
                    field(fields::CANCELLED_AT, ts(now)),
                    field(fields::UPDATED_AT, ts(now)),
                ])
                .queue(queue_op);
            if !self.store.guarded_write(&write).await? {
                continue;
            }

            if job.status != JobStatus::Processing {
                if let Some(path) = &job.checkpoint.temp_artifact_path {
                    remove_artifact(path).await;
                }
            }
            info!(job_id = %job_id, from = %job.status, "Export cancelled");
            job.status = JobStatus::Cancelled;
            job.cancelled_at = Some(now);
            job.updated_at = now;
            self.registry.publish(job_id, ExportEvent::Cancelled { job_id: job_id.clone() });
            return Ok(job);
        }
        Err(ExportError::Store(format!(
            "job {} kept changing while cancelling",
            job_id
        )))
    }

    /// processing → completed.
    pub async fn complete(&self, job_id: &JobId, artifact: &ExportArtifact) -> ExportResult<bool> {
        let now = ts(Utc::now());
        let write = GuardedWrite::expecting(self.keys.job(job_id.as_str()), &[JobStatus::Processing]).fields(vec![
            field(fields::STATUS, JobStatus::Completed),
            field(fields::COMPLETED_AT, &now),
            field(fields::UPDATED_AT, &now),
            field(fields::PROCESSED_ITEMS, artifact.total_items),
            field(fields::TOTAL_ITEMS, artifact.total_items),
            field(fields::RESULT, serde_json::to_string(artifact)?),
            field(fields::ERROR, ""),
        ]);
        if !self.store.guarded_write(&write).await? {
            return Ok(false);
        }
        info!(
            job_id = %job_id,
            total_items = artifact.total_items,
            file_size_bytes = artifact.file_size_bytes,
            from_cache = artifact.from_cache,
            "Export completed"
        );
        self.registry.publish(
            job_id,
            ExportEvent::Completed {
                job_id: job_id.clone(),
                filename: artifact.filename.clone(),
                file_size_bytes: artifact.file_size_bytes,
                total_items: artifact.total_items,
                from_cache: artifact.from_cache,
            },
        );
        Ok(true)
    }

    /// processing → failed. The error is recorded and broadcast once.
    pub async fn fail(&self, job_id: &JobId, error: &str) -> ExportResult<bool> {
        let now = ts(Utc::now());
        let write = GuardedWrite::expecting(self.keys.job(job_id.as_str()), &[JobStatus::Processing]).fields(vec![
            field(fields::STATUS, JobStatus::Failed),
            field(fields::FAILED_AT, &now),
            field(fields::UPDATED_AT, &now),
            field(fields::ERROR, error),
        ]);
        if !self.store.guarded_write(&write).await? {
            return Ok(false);
        }
        warn!(job_id = %job_id, error, "Export failed");
        self.registry.publish(
            job_id,
            ExportEvent::Failed {
                job_id: job_id.clone(),
                error: error.to_string(),
            },
        );
        Ok(true)
    }

    /// processing → pending for a job whose run went silent.
    pub async fn requeue_stalled(&self, job: &Job) -> ExportResult<bool> {
        self.return_to_pending(job, vec![field(fields::RECOVERED_AT, ts(Utc::now()))])
            .await
    }

    /// processing → pending for a job orphaned by a crashed process.
    pub async fn recover(&self, job: &Job) -> ExportResult<bool> {
        self.return_to_pending(job, vec![field(fields::RECOVERED_AT, ts(Utc::now()))])
            .await
    }

    async fn return_to_pending(&self, job: &Job, extra: Vec<(String, String)>) -> ExportResult<bool> {
        let write = GuardedWrite::expecting(self.keys.job(job.id.as_str()), &[JobStatus::Processing])
            .fields(vec![
                field(fields::STATUS, JobStatus::Pending),
                field(fields::UPDATED_AT, ts(Utc::now())),
            ])
            .fields(extra)
            .queue(QueueOp::Add {
                key: self.keys.pending_queue(),
                member: job.id.to_string(),
                score: job.dispatch_score(),
            });
        let applied = self.store.guarded_write(&write).await?;
        if applied {
            debug!(job_id = %job.id, priority = job.priority, "Job returned to pending");
            self.dispatch.notify_one();
        }
        Ok(applied)
    }

    /// Marks a job as running in this process.
    pub async fn begin_run(&self, job_id: &JobId) {
        self.running.lock().await.insert(job_id.clone());
    }

    /// Returns true if a run of the job is alive in this process.
    pub async fn is_running(&self, job_id: &JobId) -> bool {
        self.running.lock().await.contains(job_id)
    }

    /// Ends a run. After a pause suspension, a resume that landed while the
    /// run was exiting leaves the job processing with no run; such a job is
    /// put back in the queue.
    pub async fn finish_run(&self, job_id: &JobId, suspended_by_pause: bool) -> ExportResult<()> {
        let mut running = self.running.lock().await;
        running.remove(job_id);
        self.progress_marks.lock().remove(job_id);

        if suspended_by_pause && self.current_status(job_id).await? == Some(JobStatus::Processing) {
            if let Some(job) = self.load(job_id).await? {
                debug!(job_id = %job_id, "Resume raced suspension, requeueing");
                self.return_to_pending(&job, Vec::new()).await?;
            }
        }
        drop(running);
        Ok(())
    }

    async fn rejected(&self, job_id: &JobId, to: JobStatus) -> ExportError {
        match self.current_status(job_id).await {
            Ok(Some(from)) => ExportError::InvalidTransition {
                job_id: job_id.to_string(),
                from,
                to,
            },
            Ok(None) => ExportError::NotFound(job_id.to_string()),
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TaskFilter;
    use crate::job::{ExportFormat, ExportPayload, JobOptions, TASK_EXPORT_JOB};
    use crate::store::MemoryStore;
    use std::path::PathBuf;

    struct Fixture {
        state: JobStateManager,
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let state = JobStateManager::new(
            store.clone(),
            StoreKeys::new("t"),
            registry.clone(),
            GatewayConfig::default(),
        );
        Fixture { state, store, registry }
    }

    async fn insert(f: &Fixture, status: JobStatus) -> Job {
        let payload = ExportPayload {
            format: ExportFormat::Csv,
            filter: TaskFilter::default(),
            requester_id: "u".into(),
        };
        let mut job = Job::new(JobId::new(), TASK_EXPORT_JOB, payload, JobOptions::default());
        job.status = status;
        let key = f.state.keys().job(job.id.as_str());
        f.store.hset_fields(&key, &job.to_fields().unwrap()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn test_pause_requires_processing() {
        let f = fixture();
        let pending = insert(&f, JobStatus::Pending).await;
        let err = f.state.pause(&pending.id).await.unwrap_err();
        assert!(matches!(
            err,
            ExportError::InvalidTransition { from: JobStatus::Pending, to: JobStatus::Paused, .. }
        ));

        let missing = f.state.pause(&JobId::from_string("nope")).await.unwrap_err();
        assert!(matches!(missing, ExportError::NotFound(_)));

        let running = insert(&f, JobStatus::Processing).await;
        let paused = f.state.pause(&running.id).await.unwrap();
        assert_eq!(paused.status, JobStatus::Paused);
        assert!(paused.paused_at.is_some());
    }

    #[tokio::test]
    async fn test_resume_without_live_run_requeues() {
        let f = fixture();
        let job = insert(&f, JobStatus::Paused).await;
        let resumed = f.state.resume(&job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Pending);

        let queued = f
            .store
            .zrange_by_score(&f.state.keys().pending_queue(), f64::MIN, f64::MAX, 10)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, job.id.to_string());
    }

    #[tokio::test]
    async fn test_resume_with_live_run_continues_in_place() {
        let f = fixture();
        let job = insert(&f, JobStatus::Paused).await;
        f.state.begin_run(&job.id).await;
        let resumed = f.state.resume(&job.id).await.unwrap();
        assert_eq!(resumed.status, JobStatus::Processing);
        assert_eq!(f.store.zcard(&f.state.keys().pending_queue()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_finish_run_requeues_raced_resume() {
        let f = fixture();
        let job = insert(&f, JobStatus::Processing).await;
        f.state.begin_run(&job.id).await;

        f.state.finish_run(&job.id, true).await.unwrap();
        assert_eq!(f.state.current_status(&job.id).await.unwrap(), Some(JobStatus::Pending));
        assert!(!f.state.is_running(&job.id).await);
    }

    #[tokio::test]
    async fn test_cancel_paused_deletes_artifact() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("partial.csv");
        tokio::fs::write(&path, b"id\n").await.unwrap();

        let job = insert(&f, JobStatus::Processing).await;
        f.state.save_checkpoint(&job.id, 0, 3, &path).await.unwrap();
        f.state.pause(&job.id).await.unwrap();

        let cancelled = f.state.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(!path.exists());

        let again = f.state.cancel(&job.id).await.unwrap_err();
        assert!(matches!(again, ExportError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_pending_leaves_queue() {
        let f = fixture();
        let job = insert(&f, JobStatus::Pending).await;
        let queue = f.state.keys().pending_queue();
        f.store.zadd(&queue, job.id.as_str(), job.dispatch_score()).await.unwrap();

        f.state.cancel(&job.id).await.unwrap();
        assert_eq!(f.store.zcard(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_progress_is_throttled() {
        let f = fixture();
        let (conn, mut rx) = f.registry.subscribe();
        let job = insert(&f, JobStatus::Processing).await;
        f.state.bind_connection(&job.id, &conn).await.unwrap();

        for processed in [1, 2, 3, 6, 7, 100] {
            assert!(f.state.report_progress(&job.id, processed, 100).await.unwrap());
        }
        let mut percents = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExportEvent::Progress { percent, .. } = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents, vec![1, 6, 100]);

        let stored = f.state.require(&job.id).await.unwrap();
        assert_eq!(stored.progress.processed_items, 100);
        assert_eq!(stored.connection_id.as_deref(), Some(conn.as_str()));
    }

    #[tokio::test]
    async fn test_complete_only_from_processing() {
        let f = fixture();
        let job = insert(&f, JobStatus::Cancelled).await;
        let artifact = ExportArtifact {
            filename: "f.csv".into(),
            artifact_path: PathBuf::from("/tmp/f.csv"),
            file_size_bytes: 1,
            total_items: 1,
            from_cache: false,
        };
        assert!(!f.state.complete(&job.id, &artifact).await.unwrap());

        let job = insert(&f, JobStatus::Processing).await;
        assert!(f.state.complete(&job.id, &artifact).await.unwrap());
        let done = f.state.require(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result, Some(artifact));
    }
}
