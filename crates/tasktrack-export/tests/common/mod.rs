//! Common test infrastructure for export integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasktrack_config::{ExportConfig, StoreConfig};
use tasktrack_core::{Task, TaskPriority};
use tasktrack_export::cache::{ExportHistoryRecord, ExportHistoryStore, HistoryPredicate, HistoryUpdate};
use tasktrack_export::store::GuardedWrite;
use tasktrack_export::{
    DurableStore, ExportError, ExportRequest, ExportResult, ExportService, ExportServiceInterface, Job, JobId,
    JobStatus, MemoryStore, MemoryTaskSource, RedisStore,
};
use tempfile::TempDir;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::{Redis, REDIS_PORT};

/// An in-process export service over a memory task source.
///
/// Owns the artifact directory so files live as long as the harness.
pub struct TestExports {
    pub service: Arc<ExportService>,
    pub source: Arc<MemoryTaskSource>,
    _dir: TempDir,
}

impl TestExports {
    /// Harness with `tasks` medium-priority tasks and default settings.
    pub fn new(tasks: usize) -> Self {
        Self::with_config(MemoryTaskSource::with_tasks(sample_tasks(tasks)), ExportConfig::default())
    }

    /// Harness over `source`, with the artifact directory redirected to a
    /// temporary directory.
    pub fn with_config(source: MemoryTaskSource, mut config: ExportConfig) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create artifact dir");
        config.executor.artifact_dir = dir.path().to_path_buf();
        let source = Arc::new(source);
        let service = Arc::new(ExportService::in_memory(source.clone(), config));
        Self {
            service,
            source,
            _dir: dir,
        }
    }

    /// Submits an export with default filter.
    pub async fn submit(&self, format: &str, priority: i64) -> Job {
        self.service
            .submit(ExportRequest {
                format: format.to_string(),
                priority: Some(priority),
                requester_id: "tester".to_string(),
                ..ExportRequest::default()
            })
            .await
            .expect("Failed to submit export")
    }

    /// Polls until the job reaches `status`.
    pub async fn wait_for(&self, job_id: &JobId, status: JobStatus) -> Job {
        wait_until(&self.service, job_id, |job| job.status == status).await
    }
}

/// Polls a job until `done` holds, panicking after five seconds.
pub async fn wait_until(service: &ExportService, job_id: &JobId, done: impl Fn(&Job) -> bool) -> Job {
    let mut last = None;
    for _ in 0..500 {
        let job = service.job(job_id).await.expect("Failed to load job");
        if done(&job) {
            return job;
        }
        last = Some(job);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached the expected state: {:?}", job_id, last);
}

/// `count` tasks titled `task 000`, `task 001`, ...
pub fn sample_tasks(count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| Task::new(format!("task {:03}", i), TaskPriority::Medium))
        .collect()
}

/// Redis container wrapper.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    url: String,
}

impl TestRedis {
    /// Starts a fresh Redis container.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");
        let port = container
            .get_host_port_ipv4(REDIS_PORT)
            .await
            .expect("Failed to get Redis port");
        Self {
            _container: container,
            url: format!("redis://127.0.0.1:{}", port),
        }
    }

    /// Connects a store to the container.
    pub async fn store(&self) -> RedisStore {
        let config = StoreConfig {
            url: self.url.clone(),
            pool_size: 4,
            ..StoreConfig::default()
        };
        RedisStore::connect(&config)
            .await
            .expect("Failed to connect to Redis")
    }
}

/// Memory store that rejects operations on keys containing an outage
/// marker. An empty marker takes the whole store down.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    outage: Mutex<Option<String>>,
    rejected: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every key containing `marker` until [`FlakyStore::heal`].
    pub fn break_keys(&self, marker: &str) {
        *self.outage.lock() = Some(marker.to_string());
    }

    pub fn heal(&self) {
        *self.outage.lock() = None;
    }

    /// Operations rejected so far.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    /// The healthy store underneath, for inspection during an outage.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self, key: &str) -> ExportResult<()> {
        let down = match self.outage.lock().as_deref() {
            Some(marker) => key.contains(marker),
            None => false,
        };
        if down {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ExportError::Store(format!("connection refused ({})", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> ExportResult<()> {
        self.check(key)?;
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> ExportResult<bool> {
        self.check(key)?;
        self.inner.zrem(key, member).await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64, limit: usize) -> ExportResult<Vec<(String, f64)>> {
        self.check(key)?;
        self.inner.zrange_by_score(key, min, max, limit).await
    }

    async fn zcard(&self, key: &str) -> ExportResult<u64> {
        self.check(key)?;
        self.inner.zcard(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> ExportResult<Option<String>> {
        self.check(key)?;
        self.inner.hget(key, field).await
    }

    async fn hget_all(&self, key: &str) -> ExportResult<HashMap<String, String>> {
        self.check(key)?;
        self.inner.hget_all(key).await
    }

    async fn hset_fields(&self, key: &str, fields: &[(String, String)]) -> ExportResult<()> {
        self.check(key)?;
        self.inner.hset_fields(key, fields).await
    }

    async fn get(&self, key: &str) -> ExportResult<Option<String>> {
        self.check(key)?;
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ExportResult<()> {
        self.check(key)?;
        self.inner.set_ex(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> ExportResult<bool> {
        self.check(key)?;
        self.inner.del(key).await
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> ExportResult<(u64, Vec<String>)> {
        self.check(pattern)?;
        self.inner.scan(pattern, cursor, count).await
    }

    async fn claim_next(&self, queue_key: &str, job_key_prefix: &str, now_ms: i64) -> ExportResult<Option<String>> {
        self.check(queue_key)?;
        self.inner.claim_next(queue_key, job_key_prefix, now_ms).await
    }

    async fn guarded_write(&self, write: &GuardedWrite) -> ExportResult<bool> {
        self.check(&write.key)?;
        self.inner.guarded_write(write).await
    }

    async fn ping(&self) -> ExportResult<()> {
        self.check("")?;
        self.inner.ping().await
    }
}

/// History store whose every call fails.
#[derive(Default)]
pub struct OfflineHistory {
    pub calls: AtomicUsize,
}

impl OfflineHistory {
    fn offline<T>(&self) -> ExportResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ExportError::Cache("export history unreachable".to_string()))
    }
}

#[async_trait]
impl ExportHistoryStore for OfflineHistory {
    async fn insert(&self, _record: &ExportHistoryRecord) -> ExportResult<()> {
        self.offline()
    }

    async fn find_by_key(&self, _cache_key: &str) -> ExportResult<Option<ExportHistoryRecord>> {
        self.offline()
    }

    async fn update_by_key(&self, _cache_key: &str, _update: &HistoryUpdate) -> ExportResult<bool> {
        self.offline()
    }

    async fn delete_many(&self, _predicate: &HistoryPredicate) -> ExportResult<Vec<ExportHistoryRecord>> {
        self.offline()
    }

    async fn references_artifact(&self, _path: &Path) -> ExportResult<bool> {
        self.offline()
    }
}
