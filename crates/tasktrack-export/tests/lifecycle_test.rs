//! Pause/resume, cancellation, reconnect and retention through the
//! export service.

mod common;

use chrono::Utc;
use common::{sample_tasks, wait_until, TestExports};
use std::time::Duration;
use tasktrack_config::ExportConfig;
use tasktrack_export::job::TASK_EXPORT_JOB;
use tasktrack_export::{
    DurableStore, ExportError, ExportEvent, ExportFormat, ExportPayload, ExportRequest, ExportServiceInterface, GatewayCommand, Job, JobId,
    JobOptions, JobStatus, MemoryTaskSource, TaskFilter,
};
use tokio::sync::mpsc::UnboundedReceiver;

fn slow_exports(tasks: usize) -> TestExports {
    let mut config = ExportConfig::default();
    config.executor.batch_size = 5;
    config.executor.checkpoint_items = 10;
    config.gateway.progress_step_percent = 1;
    let source = MemoryTaskSource::with_tasks(sample_tasks(tasks)).with_batch_delay(Duration::from_millis(15));
    TestExports::with_config(source, config)
}

fn drain(rx: &mut UnboundedReceiver<ExportEvent>) -> Vec<ExportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_resume_never_regresses_below_checkpoint() {
    let t = slow_exports(100);
    t.service.initialize().await.unwrap();
    let (connection, mut rx) = t.service.gateway().connect();

    let job = t
        .service
        .submit(ExportRequest {
            format: "csv".into(),
            connection_id: Some(connection.to_string()),
            ..ExportRequest::default()
        })
        .await
        .unwrap();
    wait_until(&t.service, &job.id, |j| j.progress.processed_items >= 25).await;

    t.service
        .gateway()
        .handle(&connection, GatewayCommand::Pause { job_id: job.id.clone() })
        .await
        .unwrap();
    let state = t.service.state().clone();
    for _ in 0..500 {
        if !state.is_running(&job.id).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let paused = t.service.job(&job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    let checkpoint = paused.checkpoint.last_checkpoint_items;
    assert!(checkpoint >= 25);
    assert!(paused.checkpoint.temp_artifact_path.is_some());
    drain(&mut rx);

    t.service.resume(&job.id).await.unwrap();
    let done = t.wait_for(&job.id, JobStatus::Completed).await;
    assert_eq!(done.progress.processed_items, 100);

    let progress: Vec<u64> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ExportEvent::Progress { processed_items, .. } => Some(processed_items),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.iter().all(|&p| p >= checkpoint), "{:?} < {}", progress, checkpoint);

    let download = t.service.download(&job.id).await.unwrap();
    let body = String::from_utf8(download.bytes).unwrap();
    assert_eq!(body.lines().count(), 101);
    for i in 0..100 {
        assert_eq!(body.matches(&format!(",task {:03},", i)).count(), 1, "row {} duplicated or lost", i);
    }
    t.service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_export_discards_artifact() {
    let t = slow_exports(100);
    t.service.initialize().await.unwrap();
    let job = t.submit("json", 0).await;
    wait_until(&t.service, &job.id, |j| j.progress.processed_items >= 10).await;

    t.service.cancel(&job.id).await.unwrap();
    let state = t.service.state().clone();
    for _ in 0..500 {
        if !state.is_running(&job.id).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let cancelled = t.service.job(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.result.is_none());
    if let Some(path) = cancelled.checkpoint.temp_artifact_path {
        assert!(!path.exists());
    }
    assert!(t.service.cancel(&job.id).await.is_err());
    t.service.shutdown().await;
}

#[tokio::test]
async fn test_cancel_pending_export_never_runs() {
    let t = TestExports::new(5);
    let job = t.submit("csv", 0).await;
    t.service.cancel(&job.id).await.unwrap();
    assert_eq!(t.service.stats().await.unwrap().pending, 0);

    t.service.initialize().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = t.service.job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.started_at.is_none());
    t.service.shutdown().await;
}

fn silent_job(connection: &str, status: JobStatus, silent_for: chrono::Duration) -> Job {
    let payload = ExportPayload {
        format: ExportFormat::Csv,
        filter: TaskFilter::default(),
        requester_id: "tester".into(),
    };
    let mut job = Job::new(JobId::new(), TASK_EXPORT_JOB, payload, JobOptions::default());
    job.status = status;
    job.attempts = 1;
    job.started_at = Some(Utc::now() - silent_for);
    job.updated_at = Utc::now() - silent_for;
    job.connection_id = Some(connection.to_string());
    job
}

async fn persist(t: &TestExports, job: &Job) {
    let key = t.service.state().keys().job(job.id.as_str());
    t.service
        .store()
        .hset_fields(&key, &job.to_fields().unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stalled_job_resumes_on_reconnect() {
    let t = TestExports::new(20);
    t.service.initialize().await.unwrap();

    // Claimed by a peer process that has since gone silent.
    let stalled = silent_job("peer-conn", JobStatus::Processing, chrono::Duration::minutes(10));
    let paused = silent_job("peer-conn", JobStatus::Paused, chrono::Duration::minutes(10));
    persist(&t, &stalled).await;
    persist(&t, &paused).await;

    let (connection, mut rx) = t.service.gateway().connect();
    drain(&mut rx);
    t.service
        .gateway()
        .handle(
            &connection,
            GatewayCommand::Reconnect {
                previous_connection_id: "peer-conn".into(),
            },
        )
        .await
        .unwrap();

    let done = t.wait_for(&stalled.id, JobStatus::Completed).await;
    assert!(done.recovered_at.is_some());
    assert_eq!(done.progress.processed_items, 20);
    assert_eq!(done.connection_id.as_deref(), Some(connection.as_str()));
    assert_eq!(t.service.job(&paused.id).await.unwrap().status, JobStatus::Paused);

    let events = drain(&mut rx);
    let Some(jobs) = events.iter().find_map(|event| match event {
        ExportEvent::ActiveJobsSnapshot { jobs } => Some(jobs),
        _ => None,
    }) else {
        panic!("no snapshot in {:?}", events);
    };
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().any(|j| j.job_id == stalled.id && j.stalled));
    assert!(jobs.iter().any(|j| j.job_id == paused.id && !j.stalled));
    assert!(events
        .iter()
        .any(|e| matches!(e, ExportEvent::Completed { job_id, .. } if *job_id == stalled.id)));
    t.service.shutdown().await;
}

#[tokio::test]
async fn test_status_poll_on_completed_job_repeats_completion() {
    let t = TestExports::new(3);
    t.service.initialize().await.unwrap();
    let job = t.submit("json", 0).await;
    t.wait_for(&job.id, JobStatus::Completed).await;

    let (connection, mut rx) = t.service.gateway().connect();
    drain(&mut rx);
    t.service
        .gateway()
        .handle(&connection, GatewayCommand::GetStatus { job_id: job.id.clone() })
        .await
        .unwrap();
    let names: Vec<&str> = drain(&mut rx).iter().map(ExportEvent::name).collect();
    assert_eq!(names, vec!["status", "completed"]);
    t.service.shutdown().await;
}

#[tokio::test]
async fn test_cleanup_removes_only_expired_jobs() {
    let t = TestExports::new(1);
    let mut old = silent_job("c", JobStatus::Completed, chrono::Duration::hours(25));
    old.completed_at = Some(Utc::now() - chrono::Duration::hours(25));
    let mut recent = silent_job("c", JobStatus::Completed, chrono::Duration::hours(1));
    recent.completed_at = Some(Utc::now() - chrono::Duration::hours(1));
    let mut old_cancel = silent_job("c", JobStatus::Cancelled, chrono::Duration::hours(30));
    old_cancel.cancelled_at = Some(Utc::now() - chrono::Duration::hours(30));
    let running = silent_job("c", JobStatus::Processing, chrono::Duration::hours(48));
    for job in [&old, &recent, &old_cancel, &running] {
        persist(&t, job).await;
    }

    let report = t.service.cleanup(Duration::from_millis(86_400_000)).await.unwrap();
    assert_eq!(report.removed, 2);
    assert!(matches!(t.service.job(&old.id).await, Err(ExportError::NotFound(_))));
    assert!(matches!(t.service.job(&old_cancel.id).await, Err(ExportError::NotFound(_))));
    assert_eq!(t.service.job(&recent.id).await.unwrap().status, JobStatus::Completed);
    assert_eq!(t.service.job(&running.id).await.unwrap().status, JobStatus::Processing);
}

#[tokio::test]
async fn test_cleanup_deletes_uncached_results_and_keeps_cached_ones() {
    let t = slow_exports(40);
    t.service.initialize().await.unwrap();

    let resumed = t.submit("csv", 0).await;
    wait_until(&t.service, &resumed.id, |j| j.progress.processed_items >= 10).await;
    t.service.pause(&resumed.id).await.unwrap();
    let state = t.service.state().clone();
    for _ in 0..500 {
        if !state.is_running(&resumed.id).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    t.service.resume(&resumed.id).await.unwrap();
    let resumed = t.wait_for(&resumed.id, JobStatus::Completed).await;
    let resumed_result = resumed.result.clone().unwrap();
    assert!(!resumed_result.from_cache);

    let fresh = t.submit("csv", 0).await;
    let fresh = t.wait_for(&fresh.id, JobStatus::Completed).await;
    let fresh_result = fresh.result.clone().unwrap();
    assert!(!fresh_result.from_cache);
    assert_ne!(fresh_result.artifact_path, resumed_result.artifact_path);
    assert!(t.service.cache().references(&fresh_result.artifact_path).await);
    assert!(!t.service.cache().references(&resumed_result.artifact_path).await);

    for job in [&resumed, &fresh] {
        let mut aged = job.clone();
        aged.completed_at = Some(Utc::now() - chrono::Duration::hours(48));
        persist(&t, &aged).await;
    }
    let report = t.service.cleanup(Duration::from_secs(86_400)).await.unwrap();
    assert_eq!(report.removed, 2);
    assert!(!resumed_result.artifact_path.exists());
    assert!(fresh_result.artifact_path.exists());
    t.service.shutdown().await;
}

#[tokio::test]
async fn test_maintenance_requeues_stalled_job_nobody_reconnects_for() {
    let mut config = ExportConfig::default();
    config.gateway.stall_threshold_secs = 1;
    let t = TestExports::with_config(MemoryTaskSource::with_tasks(sample_tasks(8)), config);
    t.service.initialize().await.unwrap();

    let stalled = silent_job("gone-for-good", JobStatus::Processing, chrono::Duration::minutes(10));
    persist(&t, &stalled).await;

    let done = t.wait_for(&stalled.id, JobStatus::Completed).await;
    assert!(done.recovered_at.is_some());
    assert_eq!(done.attempts, 2);
    assert_eq!(done.progress.processed_items, 8);
    t.service.shutdown().await;
}
