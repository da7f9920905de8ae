//! Real-time job gateway.
//!
//! A client connects, receives a `connected` event carrying its connection
//! id, and from then on gets lifecycle events for every job it has touched.
//! Commands from the client (pause, resume, cancel, status) bind the target
//! job to that connection. After a dropped connection the client sends
//! `reconnect` with its previous id; its bindings move to the new
//! connection and it receives a snapshot of its active jobs. Processing
//! jobs that have gone silent past the stall threshold are requeued at that
//! point, and by the periodic [`ExportGateway::sweep_stalled`] for jobs
//! whose client never comes back.

mod registry;

pub use self::registry::{ConnectionId, ConnectionRegistry};

use crate::error::{ExportError, ExportResult};
use crate::events::{ExportEvent, GatewayCommand, JobSnapshot};
use crate::job::{fields, Job, JobId, JobStatus};
use crate::metrics::GatewayMetrics;
use crate::state::JobStateManager;
use crate::store::DurableStore;
use chrono::Utc;
use std::sync::Arc;
use tasktrack_config::GatewayConfig;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Outcome of a reconnect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectReport {
    /// Jobs now bound to the new connection.
    pub rebound: Vec<JobId>,
    /// Jobs requeued because their run went silent.
    pub stalled: Vec<JobId>,
}

/// Per-connection command handling on top of [`JobStateManager`].
pub struct ExportGateway {
    state: Arc<JobStateManager>,
    store: Arc<dyn DurableStore>,
    config: GatewayConfig,
}

impl ExportGateway {
    pub fn new(state: Arc<JobStateManager>, store: Arc<dyn DurableStore>, config: GatewayConfig) -> Self {
        Self { state, store, config }
    }

    fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.state.registry()
    }

    /// Opens a connection. The first event on the stream is `connected`.
    pub fn connect(&self) -> (ConnectionId, UnboundedReceiver<ExportEvent>) {
        let (id, rx) = self.registry().subscribe();
        self.registry().send_to(
            &id,
            ExportEvent::Connected {
                connection_id: id.to_string(),
            },
        );
        info!(connection_id = %id, "Gateway client connected");
        (id, rx)
    }

    /// Closes a connection. Its job bindings stay for a later reconnect.
    pub fn disconnect(&self, id: &ConnectionId) {
        self.registry().unsubscribe(id);
        info!(connection_id = %id, "Gateway client disconnected");
    }

    /// Binds a job to a connection so its events reach that client.
    pub async fn watch(&self, connection: &ConnectionId, job_id: &JobId) -> ExportResult<()> {
        if !self.state.bind_connection(job_id, connection).await? {
            return Err(ExportError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Runs one client command. Failures are also sent to the client as an
    /// `error` event.
    pub async fn handle(&self, connection: &ConnectionId, command: GatewayCommand) -> ExportResult<()> {
        debug!(connection_id = %connection, ?command, "Gateway command");
        let target = command.job_id().cloned();
        let result = self.execute(connection, command).await;
        if let Err(e) = &result {
            self.registry().send_to(
                connection,
                ExportEvent::Error {
                    job_id: target,
                    message: e.to_string(),
                },
            );
        }
        result
    }

    /// Tells a client its message could not be understood.
    pub fn reject(&self, connection: &ConnectionId, message: impl Into<String>) {
        let message = message.into();
        debug!(connection_id = %connection, %message, "Rejected gateway message");
        self.registry().send_to(connection, ExportEvent::Error { job_id: None, message });
    }

    async fn execute(&self, connection: &ConnectionId, command: GatewayCommand) -> ExportResult<()> {
        if let GatewayCommand::Reconnect { previous_connection_id } = &command {
            self.reconnect(connection, &ConnectionId::from_string(previous_connection_id.as_str()))
                .await?;
            return Ok(());
        }

        if let Some(job_id) = command.job_id() {
            self.watch(connection, job_id).await?;
        }
        match command {
            GatewayCommand::Pause { job_id } => self.state.pause(&job_id).await.map(|_| ()),
            GatewayCommand::Resume { job_id } => self.state.resume(&job_id).await.map(|_| ()),
            GatewayCommand::Cancel { job_id } => self.state.cancel(&job_id).await.map(|_| ()),
            GatewayCommand::GetStatus { job_id } => self.send_status(connection, &job_id).await,
            GatewayCommand::Reconnect { .. } => Ok(()),
        }
    }

    /// Sends a `status` event, followed by `completed` for finished jobs so
    /// a client that missed the live event still learns the result.
    pub async fn send_status(&self, connection: &ConnectionId, job_id: &JobId) -> ExportResult<()> {
        let job = self.state.require(job_id).await?;
        self.registry().send_to(
            connection,
            ExportEvent::Status {
                job: JobSnapshot::from(&job),
            },
        );
        if job.status == JobStatus::Completed {
            if let Some(event) = ExportEvent::completed(&job) {
                self.registry().send_to(connection, event);
            }
        }
        Ok(())
    }

    /// Moves every job bound to `previous` onto `current`, sends the
    /// client a snapshot of its active jobs, and requeues stalled ones.
    pub async fn reconnect(&self, current: &ConnectionId, previous: &ConnectionId) -> ExportResult<ReconnectReport> {
        let mut rebound = self.registry().rebind(previous, current);

        // Bindings made by another process only exist on the records.
        for key in self.store.scan_all(&self.state.keys().job_pattern()).await? {
            let owner = self.store.hget(&key, fields::CONNECTION_ID).await?;
            if owner.as_deref() != Some(previous.as_str()) {
                continue;
            }
            let Some(id) = key.strip_prefix(&self.state.keys().job_prefix()) else {
                continue;
            };
            let job_id = JobId::from_string(id);
            if !rebound.contains(&job_id) {
                rebound.push(job_id);
            }
        }
        rebound.sort();
        for job_id in &rebound {
            self.state.bind_connection(job_id, current).await?;
        }

        let threshold = self.stall_threshold()?;
        let mut snapshot = Vec::new();
        let mut stalled = Vec::new();
        for job_id in self.registry().jobs_for(current) {
            let job = match self.state.load(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Skipping unreadable job in snapshot");
                    continue;
                }
            };
            if !job.status.is_active() {
                continue;
            }

            let mut view = JobSnapshot::from(&job);
            if self.requeue_if_stalled(&job, threshold).await? {
                view.status = JobStatus::Pending;
                view.stalled = true;
                stalled.push(job.id.clone());
            }
            snapshot.push(view);
        }

        info!(
            connection_id = %current,
            previous_connection_id = %previous,
            rebound = rebound.len(),
            stalled = stalled.len(),
            "Gateway client reconnected"
        );
        self.registry()
            .send_to(current, ExportEvent::ActiveJobsSnapshot { jobs: snapshot });
        Ok(ReconnectReport { rebound, stalled })
    }

    /// Requeues every stalled processing job, connected client or not.
    /// Bound clients get a `status` event for each.
    pub async fn sweep_stalled(&self) -> ExportResult<Vec<JobId>> {
        let threshold = self.stall_threshold()?;
        let mut stalled = Vec::new();
        for key in self.store.scan_all(&self.state.keys().job_pattern()).await? {
            if self.store.hget(&key, fields::STATUS).await?.as_deref() != Some(JobStatus::Processing.as_str()) {
                continue;
            }
            let Some(id) = key.strip_prefix(&self.state.keys().job_prefix()) else {
                continue;
            };
            let job = match self.state.load(&JobId::from_string(id)).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable job in stall sweep");
                    continue;
                }
            };
            if self.requeue_if_stalled(&job, threshold).await? {
                let mut view = JobSnapshot::from(&job);
                view.status = JobStatus::Pending;
                view.stalled = true;
                self.registry().publish(&job.id, ExportEvent::Status { job: view });
                stalled.push(job.id);
            }
        }
        if !stalled.is_empty() {
            info!(stalled = stalled.len(), "Stall sweep requeued exports");
        }
        Ok(stalled)
    }

    fn stall_threshold(&self) -> ExportResult<chrono::Duration> {
        chrono::Duration::from_std(self.config.stall_threshold()).map_err(|e| ExportError::Configuration(e.to_string()))
    }

    /// Requeues `job` if it is processing, silent past `threshold` and not
    /// running in this process.
    async fn requeue_if_stalled(&self, job: &Job, threshold: chrono::Duration) -> ExportResult<bool> {
        let silent = Utc::now() - job.updated_at > threshold;
        if job.status != JobStatus::Processing || !silent || self.state.is_running(&job.id).await {
            return Ok(false);
        }
        let requeued = self.state.requeue_stalled(job).await?;
        if requeued {
            warn!(job_id = %job.id, last_update = %job.updated_at, "Stalled export requeued");
            GatewayMetrics::stall_detected();
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::TaskFilter;
    use crate::job::{ExportFormat, ExportPayload, Job, JobOptions, TASK_EXPORT_JOB};
    use crate::store::{MemoryStore, StoreKeys};

    struct Fixture {
        gateway: ExportGateway,
        state: Arc<JobStateManager>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let state = Arc::new(JobStateManager::new(
            store.clone(),
            StoreKeys::new("t"),
            registry,
            GatewayConfig::default(),
        ));
        let gateway = ExportGateway::new(state.clone(), store.clone(), GatewayConfig::default());
        Fixture { gateway, state, store }
    }

    async fn insert(f: &Fixture, status: JobStatus, updated_secs_ago: i64) -> Job {
        let payload = ExportPayload {
            format: ExportFormat::Json,
            filter: TaskFilter::default(),
            requester_id: "u".into(),
        };
        let mut job = Job::new(JobId::new(), TASK_EXPORT_JOB, payload, JobOptions::default());
        job.status = status;
        job.updated_at = Utc::now() - chrono::Duration::seconds(updated_secs_ago);
        let key = f.state.keys().job(job.id.as_str());
        f.store.hset_fields(&key, &job.to_fields().unwrap()).await.unwrap();
        job
    }

    fn drain(rx: &mut UnboundedReceiver<ExportEvent>) -> Vec<ExportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_connect_sends_connection_id() {
        let f = fixture();
        let (id, mut rx) = f.gateway.connect();
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![ExportEvent::Connected {
                connection_id: id.to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_status_of_completed_job_repeats_completion() {
        let f = fixture();
        let (id, mut rx) = f.gateway.connect();
        let mut job = insert(&f, JobStatus::Completed, 0).await;
        job.result = Some(crate::job::ExportArtifact {
            filename: "tasks.json".into(),
            artifact_path: "/tmp/tasks.json".into(),
            file_size_bytes: 12,
            total_items: 2,
            from_cache: false,
        });
        let key = f.state.keys().job(job.id.as_str());
        f.store.hset_fields(&key, &job.to_fields().unwrap()).await.unwrap();
        drain(&mut rx);

        f.gateway
            .handle(&id, GatewayCommand::GetStatus { job_id: job.id.clone() })
            .await
            .unwrap();
        let names: Vec<&str> = drain(&mut rx).iter().map(ExportEvent::name).collect();
        assert_eq!(names, vec!["status", "completed"]);
    }

    #[tokio::test]
    async fn test_failed_command_sends_error_event() {
        let f = fixture();
        let (id, mut rx) = f.gateway.connect();
        drain(&mut rx);

        let job = insert(&f, JobStatus::Pending, 0).await;
        let result = f.gateway.handle(&id, GatewayCommand::Pause { job_id: job.id.clone() }).await;
        assert!(matches!(result, Err(ExportError::InvalidTransition { .. })));

        let missing = JobId::from_string("missing");
        let result = f.gateway.handle(&id, GatewayCommand::Cancel { job_id: missing.clone() }).await;
        assert!(matches!(result, Err(ExportError::NotFound(_))));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ExportEvent::Error { job_id: Some(j), .. } if *j == missing));
    }

    #[tokio::test]
    async fn test_reconnect_rebinds_and_requeues_stalled() {
        let f = fixture();
        let (old, _old_rx) = f.gateway.connect();
        let stalled = insert(&f, JobStatus::Processing, 600).await;
        let healthy = insert(&f, JobStatus::Processing, 1).await;
        let finished = insert(&f, JobStatus::Completed, 600).await;
        for job in [&stalled, &healthy, &finished] {
            f.gateway.watch(&old, &job.id).await.unwrap();
        }
        f.gateway.disconnect(&old);

        let (new, mut rx) = f.gateway.connect();
        drain(&mut rx);
        let report = f.gateway.reconnect(&new, &old).await.unwrap();
        assert_eq!(report.rebound.len(), 3);
        assert_eq!(report.stalled, vec![stalled.id.clone()]);

        let events = drain(&mut rx);
        let ExportEvent::ActiveJobsSnapshot { jobs } = &events[0] else {
            panic!("expected snapshot, got {:?}", events);
        };
        assert_eq!(jobs.len(), 2);
        let flagged: Vec<_> = jobs.iter().filter(|j| j.stalled).map(|j| j.job_id.clone()).collect();
        assert_eq!(flagged, vec![stalled.id.clone()]);

        assert_eq!(
            f.state.current_status(&stalled.id).await.unwrap(),
            Some(JobStatus::Pending)
        );
        let requeued = f.state.require(&stalled.id).await.unwrap();
        assert!(requeued.recovered_at.is_some());
        assert_eq!(requeued.connection_id.as_deref(), Some(new.as_str()));
        assert_eq!(f.store.zcard(&f.state.keys().pending_queue()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_finds_bindings_persisted_elsewhere() {
        let f = fixture();
        let job = insert(&f, JobStatus::Paused, 0).await;
        let key = f.state.keys().job(job.id.as_str());
        f.store
            .hset_fields(&key, &[(fields::CONNECTION_ID.to_string(), "other-process-conn".to_string())])
            .await
            .unwrap();

        let (new, mut rx) = f.gateway.connect();
        drain(&mut rx);
        let report = f
            .gateway
            .reconnect(&new, &ConnectionId::from_string("other-process-conn"))
            .await
            .unwrap();
        assert_eq!(report.rebound, vec![job.id.clone()]);
        assert!(report.stalled.is_empty());

        f.state.registry().publish(&job.id, ExportEvent::Cancelled { job_id: job.id.clone() });
        let events = drain(&mut rx);
        assert_eq!(events.last().map(ExportEvent::name), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_sweep_requeues_stalled_jobs_without_a_client() {
        let f = fixture();
        let (watcher, mut rx) = f.gateway.connect();
        let orphaned = insert(&f, JobStatus::Processing, 600).await;
        let watched = insert(&f, JobStatus::Processing, 900).await;
        let healthy = insert(&f, JobStatus::Processing, 1).await;
        let paused = insert(&f, JobStatus::Paused, 600).await;
        f.gateway.watch(&watcher, &watched.id).await.unwrap();
        drain(&mut rx);

        let mut swept = f.gateway.sweep_stalled().await.unwrap();
        swept.sort();
        let mut expected = vec![orphaned.id.clone(), watched.id.clone()];
        expected.sort();
        assert_eq!(swept, expected);

        assert_eq!(f.state.current_status(&healthy.id).await.unwrap(), Some(JobStatus::Processing));
        assert_eq!(f.state.current_status(&paused.id).await.unwrap(), Some(JobStatus::Paused));
        assert_eq!(f.store.zcard(&f.state.keys().pending_queue()).await.unwrap(), 2);

        let events = drain(&mut rx);
        assert!(matches!(
            &events[..],
            [ExportEvent::Status { job }] if job.job_id == watched.id && job.stalled && job.status == JobStatus::Pending
        ));
        assert!(f.gateway.sweep_stalled().await.unwrap().is_empty());
    }
}
