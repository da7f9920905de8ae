//! Persistent priority queue and dispatcher.
//!
//! Jobs live in the durable store: a record per job plus one sorted set of
//! pending ids ordered by dispatch score. A single dispatcher per process
//! claims the lowest score whenever a concurrency permit is free and hands
//! the job to the registered [`JobProcessor`]. The permit is held for the
//! whole run.

use crate::error::{ExportError, ExportResult};
use crate::job::{fields, ExportArtifact, ExportPayload, Job, JobId, JobOptions, JobStatus};
use crate::metrics::QueueMetrics;
use crate::state::JobStateManager;
use crate::store::{DurableStore, GuardedWrite, QueueOp, StoreKeys};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tasktrack_config::QueueConfig;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The artifact is written and complete.
    Completed(ExportArtifact),
    /// The run failed with a message for the client.
    Failed(String),
    /// The run stopped early because the job left `processing`. Carries the
    /// status it observed.
    Suspended(JobStatus),
}

/// Executes claimed jobs.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: Job) -> ProcessOutcome;

    /// Called after `artifact` was recorded as the job's result.
    async fn committed(&self, _job: &Job, _artifact: &ExportArtifact) {}

    /// Called when the job left `processing` before `artifact` could be
    /// recorded.
    async fn discarded(&self, _job: &Job, _artifact: &ExportArtifact) {}
}

/// Result of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: u64,
    pub skipped: u64,
}

/// Result of a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: u64,
    /// Partial artifacts of removed jobs. Nothing else references them.
    pub partials: Vec<PathBuf>,
    /// Finished artifacts of removed jobs. The export cache may still serve
    /// these to other jobs.
    pub results: Vec<PathBuf>,
}

/// Queue snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub active: u64,
    pub concurrency_limit: usize,
    pub paused: bool,
}

/// Priority queue with a single in-process dispatcher.
pub struct JobQueue {
    store: Arc<dyn DurableStore>,
    keys: StoreKeys,
    state: Arc<JobStateManager>,
    config: QueueConfig,
    permits: Arc<Semaphore>,
    processor: RwLock<Option<Arc<dyn JobProcessor>>>,
    paused: AtomicBool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn DurableStore>, state: Arc<JobStateManager>, config: QueueConfig) -> Self {
        let limit = config.concurrency_limit.max(1);
        Self {
            keys: state.keys().clone(),
            store,
            state,
            config,
            permits: Arc::new(Semaphore::new(limit)),
            processor: RwLock::new(None),
            paused: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            dispatcher: Mutex::new(None),
        }
    }

    /// Registers the processor that claimed jobs are handed to.
    pub fn set_processor(&self, processor: Arc<dyn JobProcessor>) {
        *self.processor.write() = Some(processor);
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Persists a new pending job and wakes the dispatcher.
    pub async fn add_job(
        &self,
        id: JobId,
        job_type: &str,
        payload: ExportPayload,
        options: JobOptions,
    ) -> ExportResult<Job> {
        options.validate()?;
        payload.filter.validate()?;

        let key = self.keys.job(id.as_str());
        if self.store.hget(&key, fields::STATUS).await?.is_some() {
            return Err(ExportError::validation(format!("job {} already exists", id)));
        }

        let job = Job::new(id, job_type, payload, options);
        let write = GuardedWrite::unconditional(key)
            .fields(job.to_fields()?)
            .queue(QueueOp::Add {
                key: self.keys.pending_queue(),
                member: job.id.to_string(),
                score: job.dispatch_score(),
            });
        self.store.guarded_write(&write).await?;

        info!(
            job_id = %job.id,
            priority = job.priority,
            format = %job.payload.format,
            "Export job enqueued"
        );
        QueueMetrics::job_enqueued(job.payload.format.as_str(), job.priority);
        self.state.announce_created(&job);
        self.state.dispatch_signal().notify_one();
        Ok(job)
    }

    /// Stops claiming new jobs. Running jobs continue.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Export dispatch paused");
        }
    }

    /// Resumes claiming.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Export dispatch resumed");
            self.state.dispatch_signal().notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Recovers orphaned jobs, then starts the dispatcher.
    pub async fn initialize(self: &Arc<Self>) -> ExportResult<RecoveryReport> {
        let report = self.recover_pending_jobs().await?;
        self.start();
        Ok(report)
    }

    /// Starts the dispatcher. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.dispatcher.lock();
        if slot.is_some() {
            return;
        }
        info!(concurrency_limit = self.config.concurrency_limit, "Starting export dispatcher");
        let queue = Arc::clone(self);
        *slot = Some(tokio::spawn(
            async move { queue.dispatch_loop().await }.instrument(info_span!("export_dispatcher")),
        ));
    }

    /// Stops dispatching and waits for in-flight runs, up to the configured
    /// shutdown timeout.
    pub async fn shutdown(&self) {
        info!("Stopping export dispatcher...");
        self.shutdown.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatcher task ended abnormally");
            }
        }

        self.tracker.close();
        let timeout = self.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(
                timeout_secs = timeout.as_secs(),
                in_flight = self.tracker.len(),
                "Shutdown timed out with exports still running"
            );
        } else {
            info!("Export dispatcher stopped");
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let signal = self.state.dispatch_signal();
        let idle = self.config.idle_recheck();
        let mut backoff = self.config.initial_backoff();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if self.is_paused() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = signal.notified() => {}
                    _ = tokio::time::sleep(idle) => {}
                }
                continue;
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim().await {
                Ok(Some(job)) => {
                    backoff = self.config.initial_backoff();
                    self.spawn_run(job, permit);
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = signal.notified() => {}
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    QueueMetrics::dispatch_error();
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Dispatch failed, backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff());
                }
            }
        }
        debug!("Dispatch loop exited");
    }

    /// Claims the next dispatchable job. Unreadable records are skipped.
    async fn claim(&self) -> ExportResult<Option<Job>> {
        let queue_key = self.keys.pending_queue();
        let prefix = self.keys.job_prefix();
        loop {
            let Some(id) = self
                .store
                .claim_next(&queue_key, &prefix, Utc::now().timestamp_millis())
                .await?
            else {
                return Ok(None);
            };
            let job_id = JobId::from_string(id);
            match self.state.load(&job_id).await {
                Ok(Some(job)) => return Ok(Some(job)),
                Ok(None) => continue,
                Err(ExportError::MalformedRecord { key, reason }) => {
                    error!(key = %key, reason = %reason, "Claimed an unreadable job record, skipping");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn_run(self: &Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let queue = Arc::clone(self);
        let span = info_span!("export_job", job_id = %job.id, priority = job.priority);
        self.tracker.spawn(
            async move {
                let _permit = permit;
                queue.run(job).await;
            }
            .instrument(span),
        );
    }

    async fn run(&self, job: Job) {
        let started_at = job.started_at.unwrap_or_else(Utc::now);
        let wait = (started_at - job.added_at).to_std().unwrap_or_default();
        QueueMetrics::job_dispatched(wait);
        debug!(attempt = job.attempts, wait_ms = wait.as_millis() as u64, "Export job claimed");

        let processor = self.processor.read().clone();
        let Some(processor) = processor else {
            error!("No export processor registered");
            if let Err(e) = self.state.fail(&job.id, "no export processor registered").await {
                error!(error = %e, "Failed to mark job as failed");
            }
            return;
        };

        self.state.begin_run(&job.id).await;
        let clock = Instant::now();
        let outcome = AssertUnwindSafe(processor.process(job.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| ProcessOutcome::Failed("export run panicked".to_string()));

        let mut suspended_by_pause = false;
        let settled = match outcome {
            ProcessOutcome::Completed(artifact) => match self.state.complete(&job.id, &artifact).await {
                Ok(true) => {
                    processor.committed(&job, &artifact).await;
                    Ok("completed")
                }
                Ok(false) => {
                    debug!("Export left processing before completion was recorded");
                    processor.discarded(&job, &artifact).await;
                    Ok("discarded")
                }
                Err(e) => Err(e),
            },
            ProcessOutcome::Failed(message) => self.state.fail(&job.id, &message).await.map(|_| "failed"),
            ProcessOutcome::Suspended(status) => {
                debug!(status = %status, "Export run suspended");
                suspended_by_pause = status == JobStatus::Paused;
                Ok("suspended")
            }
        };
        match settled {
            Ok(outcome) => QueueMetrics::job_finished(outcome, clock.elapsed()),
            Err(e) => error!(error = %e, "Failed to record export outcome"),
        }

        if let Err(e) = self.state.finish_run(&job.id, suspended_by_pause).await {
            warn!(error = %e, "Failed to release export run");
        }
    }

    /// Returns every `processing` record to the queue. Called at startup,
    /// before this process dispatches anything, so any such record belongs
    /// to a run that no longer exists.
    pub async fn recover_pending_jobs(&self) -> ExportResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for key in self.store.scan_all(&self.keys.job_pattern()).await? {
            let map = self.store.hget_all(&key).await?;
            if map.is_empty() {
                continue;
            }
            let job = match Job::from_fields(&key, &map) {
                Ok(job) => job,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable job record");
                    report.skipped += 1;
                    continue;
                }
            };
            if job.status != JobStatus::Processing {
                continue;
            }
            if self.state.recover(&job).await? {
                debug!(job_id = %job.id, priority = job.priority, "Recovered orphaned job");
                report.recovered += 1;
            }
        }

        if report.recovered > 0 || report.skipped > 0 {
            info!(recovered = report.recovered, skipped = report.skipped, "Recovered export jobs");
        }
        QueueMetrics::jobs_recovered("startup", report.recovered);
        Ok(report)
    }

    /// Deletes finished job records whose terminal time is older than `max_age`.
    pub async fn cleanup(&self, max_age: Duration) -> ExportResult<CleanupReport> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| ExportError::Configuration(e.to_string()))?;
        let cutoff = Utc::now() - max_age;
        let mut report = CleanupReport::default();

        for key in self.store.scan_all(&self.keys.job_pattern()).await? {
            let map = self.store.hget_all(&key).await?;
            let Ok(job) = Job::from_fields(&key, &map) else {
                continue;
            };
            let Some(finished) = job.terminal_at() else {
                continue;
            };
            if finished >= cutoff {
                continue;
            }

            if self.store.del(&key).await? {
                self.store.zrem(&self.keys.pending_queue(), job.id.as_str()).await?;
                self.state.registry().unbind(&job.id);
                report.removed += 1;
                match job.result {
                    Some(result) if !result.from_cache => report.results.push(result.artifact_path),
                    Some(_) => {}
                    None => report.partials.extend(job.checkpoint.temp_artifact_path),
                }
            }
        }

        report.results.sort();
        report.results.dedup();
        report.partials.sort();
        report.partials.dedup();
        if report.removed > 0 {
            info!(removed = report.removed, "Cleaned up finished export jobs");
        }
        QueueMetrics::jobs_cleaned(report.removed);
        Ok(report)
    }

    pub async fn stats(&self) -> ExportResult<QueueStats> {
        let pending = self.store.zcard(&self.keys.pending_queue()).await?;
        let limit = self.config.concurrency_limit.max(1);
        let active = limit.saturating_sub(self.permits.available_permits()) as u64;
        QueueMetrics::update_queue_sizes(pending, active);
        Ok(QueueStats {
            pending,
            active,
            concurrency_limit: limit,
            paused: self.is_paused(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TaskFilter;
    use crate::gateway::ConnectionRegistry;
    use crate::job::{ExportArtifact, ExportFormat, TASK_EXPORT_JOB};
    use crate::store::MemoryStore;
    use tasktrack_config::GatewayConfig;
    use tokio::sync::mpsc;

    fn payload() -> ExportPayload {
        ExportPayload {
            format: ExportFormat::Csv,
            filter: TaskFilter::default(),
            requester_id: "u".into(),
        }
    }

    fn queue_with(config: QueueConfig) -> (Arc<JobQueue>, Arc<MemoryStore>, Arc<JobStateManager>) {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(JobStateManager::new(
            store.clone(),
            StoreKeys::new("q"),
            Arc::new(ConnectionRegistry::new()),
            GatewayConfig::default(),
        ));
        let queue = Arc::new(JobQueue::new(store.clone(), state.clone(), config));
        (queue, store, state)
    }

    /// Records dispatch order and completes immediately.
    struct Recorder(mpsc::UnboundedSender<JobId>);

    #[async_trait]
    impl JobProcessor for Recorder {
        async fn process(&self, job: Job) -> ProcessOutcome {
            let _ = self.0.send(job.id.clone());
            ProcessOutcome::Completed(ExportArtifact {
                filename: "x.csv".into(),
                artifact_path: PathBuf::from("/tmp/x.csv"),
                file_size_bytes: 0,
                total_items: 0,
                from_cache: false,
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl JobProcessor for Failing {
        async fn process(&self, _job: Job) -> ProcessOutcome {
            ProcessOutcome::Failed("source unavailable".into())
        }
    }

    async fn wait_for(state: &JobStateManager, id: &JobId, status: JobStatus) {
        for _ in 0..200 {
            if state.current_status(id).await.unwrap() == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_higher_priority_dispatches_first() {
        let (queue, _, _) = queue_with(QueueConfig {
            concurrency_limit: 1,
            ..QueueConfig::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.set_processor(Arc::new(Recorder(tx)));

        let low = queue
            .add_job(JobId::from_string("j1"), TASK_EXPORT_JOB, payload(), JobOptions::default())
            .await
            .unwrap();
        let urgent = queue
            .add_job(
                JobId::from_string("j2"),
                TASK_EXPORT_JOB,
                payload(),
                JobOptions { priority: 5, max_attempts: 1 },
            )
            .await
            .unwrap();

        queue.start();
        assert_eq!(rx.recv().await, Some(urgent.id));
        assert_eq!(rx.recv().await, Some(low.id));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_job_rejects_bad_options_and_duplicates() {
        let (queue, store, _) = queue_with(QueueConfig::default());
        let bad = JobOptions { priority: 500, max_attempts: 1 };
        let err = queue.add_job(JobId::new(), TASK_EXPORT_JOB, payload(), bad).await.unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
        assert_eq!(store.key_count(), 0);

        let id = JobId::from_string("dup");
        queue.add_job(id.clone(), TASK_EXPORT_JOB, payload(), JobOptions::default()).await.unwrap();
        let err = queue
            .add_job(id, TASK_EXPORT_JOB, payload(), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Validation(_)));
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_failure_is_terminal_without_spare_attempts() {
        let (queue, _, state) = queue_with(QueueConfig::default());
        queue.set_processor(Arc::new(Failing));
        let job = queue
            .add_job(JobId::new(), TASK_EXPORT_JOB, payload(), JobOptions::default())
            .await
            .unwrap();
        queue.start();

        wait_for(&state, &job.id, JobStatus::Failed).await;
        let failed = state.require(&job.id).await.unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error.as_deref(), Some("source unavailable"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_never_requeues() {
        let (queue, store, state) = queue_with(QueueConfig::default());
        queue.set_processor(Arc::new(Failing));
        let job = queue
            .add_job(
                JobId::new(),
                TASK_EXPORT_JOB,
                payload(),
                JobOptions { priority: 0, max_attempts: 3 },
            )
            .await
            .unwrap();
        queue.start();

        wait_for(&state, &job.id, JobStatus::Failed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let failed = state.require(&job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.failed_at.is_some());
        assert_eq!(store.zcard(&state.keys().pending_queue()).await.unwrap(), 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_returns_orphans_to_queue() {
        let (queue, store, state) = queue_with(QueueConfig::default());
        for i in 0..3 {
            let mut job = Job::new(JobId::from_string(format!("orphan-{}", i)), TASK_EXPORT_JOB, payload(), JobOptions::default());
            job.status = JobStatus::Processing;
            store.hset_fields(&state.keys().job(job.id.as_str()), &job.to_fields().unwrap()).await.unwrap();
        }
        let mut done = Job::new(JobId::from_string("done"), TASK_EXPORT_JOB, payload(), JobOptions::default());
        done.status = JobStatus::Completed;
        store.hset_fields(&state.keys().job("done"), &done.to_fields().unwrap()).await.unwrap();
        store
            .hset_fields(&state.keys().job("broken"), &[("status".to_string(), "processing".to_string())])
            .await
            .unwrap();

        let report = queue.recover_pending_jobs().await.unwrap();
        assert_eq!(report, RecoveryReport { recovered: 3, skipped: 1 });
        assert_eq!(queue.stats().await.unwrap().pending, 3);

        let again = queue.recover_pending_jobs().await.unwrap();
        assert_eq!(again.recovered, 0);
    }

    #[tokio::test]
    async fn test_paused_queue_does_not_dispatch() {
        let (queue, _, state) = queue_with(QueueConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        queue.set_processor(Arc::new(Recorder(tx)));
        queue.pause();
        queue.start();

        let job = queue
            .add_job(JobId::new(), TASK_EXPORT_JOB, payload(), JobOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(queue.stats().await.unwrap().paused);

        queue.resume();
        assert_eq!(rx.recv().await, Some(job.id.clone()));
        wait_for(&state, &job.id, JobStatus::Completed).await;
        queue.shutdown().await;
    }
}
