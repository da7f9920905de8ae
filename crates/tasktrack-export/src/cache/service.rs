use super::history::{ExportHistoryRecord, ExportHistoryStore, HistoryPredicate, HistoryUpdate};
use super::{CacheKey, CachedExport, InvalidationScope, TtlClass};
use crate::artifact::{artifact_exists, remove_artifact};
use crate::error::{ExportError, ExportResult};
use crate::filter::TaskFilter;
use crate::job::{ExportArtifact, ExportFormat, Job, JobStatus};
use crate::metrics::CacheMetrics;
use crate::source::TaskSource;
use crate::store::{DurableStore, StoreKeys};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tasktrack_config::CacheConfig;
use tasktrack_core::TaskMutation;
use tracing::{debug, info, warn};

/// Outcome of a selective invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    pub ephemeral_removed: usize,
    pub durable_removed: usize,
    pub artifacts_removed: usize,
}

/// Two-tier export cache.
///
/// Every tier error is logged and swallowed: callers see a miss or a no-op,
/// never a failure.
pub struct ExportCacheService {
    store: Arc<dyn DurableStore>,
    keys: StoreKeys,
    history: Arc<dyn ExportHistoryStore>,
    source: Arc<dyn TaskSource>,
    config: CacheConfig,
}

impl ExportCacheService {
    pub fn new(
        store: Arc<dyn DurableStore>,
        keys: StoreKeys,
        history: Arc<dyn ExportHistoryStore>,
        source: Arc<dyn TaskSource>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            keys,
            history,
            source,
            config,
        }
    }

    /// Returns true if caching is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Cache key for an export of `filter` in `format` over current data.
    pub async fn key_for(&self, filter: &TaskFilter, format: ExportFormat) -> ExportResult<CacheKey> {
        let freshness = self.source.freshness(filter).await?;
        Ok(CacheKey::compute(filter, format, freshness))
    }

    /// TTL class for an export of `total_records` rows.
    pub fn ttl_class(&self, total_records: u64) -> TtlClass {
        if total_records > self.config.large_export_threshold {
            TtlClass::Extended
        } else {
            TtlClass::Standard
        }
    }

    /// Lifetime of a durable record in `class`.
    pub fn ttl_for(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Standard => Duration::from_secs(self.config.standard_ttl_secs),
            TtlClass::Extended => Duration::from_secs(self.config.extended_ttl_secs),
        }
    }

    fn storage_key(&self, key: &CacheKey) -> String {
        self.keys.cache(&key.status_facet, &key.priority_facet, &key.digest)
    }

    /// Finds a usable cached export. Checks the ephemeral tier, then the
    /// durable tier, promoting durable hits. Entries whose artifact file is
    /// gone are dropped.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CachedExport> {
        if !self.config.enabled {
            return None;
        }
        let storage_key = self.storage_key(key);

        match self.store.get(&storage_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<CachedExport>(&raw) {
                Ok(entry) if artifact_exists(&entry.artifact_path).await => {
                    debug!(digest = %key.digest, "Export cache hit (ephemeral)");
                    CacheMetrics::lookup("ephemeral");
                    return Some(entry);
                }
                Ok(entry) => {
                    debug!(path = %entry.artifact_path.display(), "Cached artifact missing, dropping entry");
                    self.drop_ephemeral(&storage_key).await;
                }
                Err(e) => {
                    swallow("decode", &e.into());
                    self.drop_ephemeral(&storage_key).await;
                }
            },
            Ok(None) => {}
            Err(e) => swallow("ephemeral_get", &e),
        }

        let record = match self.history.find_by_key(&key.digest).await {
            Ok(record) => record,
            Err(e) => {
                swallow("durable_find", &e);
                None
            }
        };
        if let Some(entry) = self.usable(key, record).await {
            debug!(digest = %key.digest, "Export cache hit (durable), promoting");
            CacheMetrics::lookup("durable");
            self.put_ephemeral(&storage_key, &entry).await;
            return Some(entry);
        }

        CacheMetrics::lookup("miss");
        None
    }

    async fn usable(&self, key: &CacheKey, record: Option<ExportHistoryRecord>) -> Option<CachedExport> {
        let record = record?;
        if record.status != JobStatus::Completed
            || record.created_at.timestamp_millis() < key.freshness_ms
            || record.expires_at <= Utc::now()
        {
            return None;
        }
        let artifact_path = record.artifact_path?;
        if !artifact_exists(&artifact_path).await {
            return None;
        }
        Some(CachedExport {
            job_id: record.job_id,
            filename: record.filename?,
            artifact_path,
            total_records: record.total_records,
            file_size_bytes: record.file_size_bytes,
            ttl_class: record.ttl_class,
            created_at: record.created_at.timestamp_millis(),
        })
    }

    /// Records that `job` is producing the export for `key`.
    pub async fn begin(&self, key: &CacheKey, job: &Job) {
        if !self.config.enabled {
            return;
        }
        let now = Utc::now();
        let record = ExportHistoryRecord {
            cache_key: key.digest.clone(),
            job_id: job.id.to_string(),
            status: JobStatus::Processing,
            format: job.payload.format,
            filter_json: job.payload.filter.normalized().to_string(),
            status_facet: key.status_facet.clone(),
            priority_facet: key.priority_facet.clone(),
            filename: None,
            artifact_path: None,
            total_records: 0,
            file_size_bytes: 0,
            ttl_class: TtlClass::Standard,
            created_at: now,
            expires_at: expiry(now, self.ttl_for(TtlClass::Standard)),
        };
        if let Err(e) = self.history.insert(&record).await {
            swallow("durable_insert", &e);
        }
    }

    /// Publishes a finished export in both tiers.
    pub async fn store(&self, key: &CacheKey, job: &Job, artifact: &ExportArtifact) {
        if !self.config.enabled {
            return;
        }
        let now = Utc::now();
        let class = self.ttl_class(artifact.total_items);
        let expires_at = expiry(now, self.ttl_for(class));

        let entry = CachedExport {
            job_id: job.id.to_string(),
            filename: artifact.filename.clone(),
            artifact_path: artifact.artifact_path.clone(),
            total_records: artifact.total_items,
            file_size_bytes: artifact.file_size_bytes,
            ttl_class: class,
            created_at: now.timestamp_millis(),
        };
        self.put_ephemeral(&self.storage_key(key), &entry).await;

        let update = HistoryUpdate {
            status: Some(JobStatus::Completed),
            filename: Some(artifact.filename.clone()),
            artifact_path: Some(artifact.artifact_path.clone()),
            total_records: Some(artifact.total_items),
            file_size_bytes: Some(artifact.file_size_bytes),
            ttl_class: Some(class),
            created_at: Some(now),
            expires_at: Some(expires_at),
        };
        match self.history.update_by_key(&key.digest, &update).await {
            Ok(true) => {}
            Ok(false) => {
                let record = ExportHistoryRecord {
                    cache_key: key.digest.clone(),
                    job_id: job.id.to_string(),
                    status: JobStatus::Completed,
                    format: job.payload.format,
                    filter_json: job.payload.filter.normalized().to_string(),
                    status_facet: key.status_facet.clone(),
                    priority_facet: key.priority_facet.clone(),
                    filename: Some(artifact.filename.clone()),
                    artifact_path: Some(artifact.artifact_path.clone()),
                    total_records: artifact.total_items,
                    file_size_bytes: artifact.file_size_bytes,
                    ttl_class: class,
                    created_at: now,
                    expires_at,
                };
                if let Err(e) = self.history.insert(&record).await {
                    swallow("durable_insert", &e);
                }
            }
            Err(e) => swallow("durable_update", &e),
        }
        info!(job_id = %job.id, digest = %key.digest, ttl_class = %class, "Export cached");
    }

    /// Marks an export that will not complete.
    pub async fn abandon(&self, key: &CacheKey) {
        if !self.config.enabled {
            return;
        }
        let update = HistoryUpdate {
            status: Some(JobStatus::Failed),
            ..Default::default()
        };
        if let Err(e) = self.history.update_by_key(&key.digest, &update).await {
            swallow("durable_update", &e);
        }
    }

    /// Removes every cache entry a task mutation could have made stale,
    /// along with their artifact files.
    pub async fn invalidate_for_mutation(&self, mutation: &TaskMutation) -> InvalidationReport {
        let scope = InvalidationScope::for_mutation(mutation);
        let mut report = InvalidationReport::default();
        let mut artifacts = BTreeSet::new();
        let mut visited = BTreeSet::new();

        for status in scope.status_candidates() {
            let pattern = self.keys.cache_status_pattern(&status);
            let keys = match self.store.scan_all(&pattern).await {
                Ok(keys) => keys,
                Err(e) => {
                    swallow("ephemeral_scan", &e);
                    continue;
                }
            };
            for key in keys {
                if !visited.insert(key.clone()) {
                    continue;
                }
                let Some((status_facet, priority_facet, _)) = self.keys.parse_cache(&key) else {
                    continue;
                };
                if !scope.covers(&status_facet, &priority_facet) {
                    continue;
                }
                if let Ok(Some(raw)) = self.store.get(&key).await {
                    if let Ok(entry) = serde_json::from_str::<CachedExport>(&raw) {
                        artifacts.insert(entry.artifact_path);
                    }
                }
                match self.store.del(&key).await {
                    Ok(true) => report.ephemeral_removed += 1,
                    Ok(false) => {}
                    Err(e) => swallow("ephemeral_delete", &e),
                }
            }
        }

        match self.history.delete_many(&HistoryPredicate::Matching(scope)).await {
            Ok(removed) => {
                report.durable_removed = removed.len();
                artifacts.extend(removed.into_iter().filter_map(|r| r.artifact_path));
            }
            Err(e) => swallow("durable_delete", &e),
        }

        report.artifacts_removed = remove_all(artifacts).await;
        CacheMetrics::evicted("mutation", (report.ephemeral_removed + report.durable_removed) as u64);
        debug!(
            task_id = %mutation.task_id,
            ephemeral = report.ephemeral_removed,
            durable = report.durable_removed,
            artifacts = report.artifacts_removed,
            "Invalidated export cache"
        );
        report
    }

    /// Removes expired durable records and their artifacts. Returns the
    /// number of records removed.
    pub async fn purge_expired(&self) -> usize {
        let removed = match self
            .history
            .delete_many(&HistoryPredicate::ExpiredBefore(Utc::now()))
            .await
        {
            Ok(removed) => removed,
            Err(e) => {
                swallow("durable_purge", &e);
                return 0;
            }
        };
        let count = removed.len();
        let artifacts = removed.into_iter().filter_map(|r| r.artifact_path).collect();
        let files = remove_all(artifacts).await;
        if count > 0 {
            CacheMetrics::evicted("expired", count as u64);
            info!(records = count, artifacts = files, "Purged expired export cache records");
        }
        count
    }

    /// Returns true if a durable record may still serve `path`. Ephemeral
    /// entries check the file on lookup, so only the durable tier counts.
    /// An unreachable tier counts as a reference; expiry purges the file.
    pub async fn references(&self, path: &Path) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.history.references_artifact(path).await {
            Ok(found) => found,
            Err(e) => {
                swallow("durable_find", &e);
                true
            }
        }
    }

    async fn put_ephemeral(&self, storage_key: &str, entry: &CachedExport) {
        let raw = match serde_json::to_string(entry) {
            Ok(raw) => raw,
            Err(e) => return swallow("encode", &e.into()),
        };
        if let Err(e) = self.store.set_ex(storage_key, &raw, self.config.ephemeral_ttl()).await {
            swallow("ephemeral_set", &e);
        }
    }

    async fn drop_ephemeral(&self, storage_key: &str) {
        if let Err(e) = self.store.del(storage_key).await {
            swallow("ephemeral_delete", &e);
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
}

async fn remove_all(paths: BTreeSet<PathBuf>) -> usize {
    let mut removed = 0;
    for path in paths {
        if remove_artifact(&path).await {
            removed += 1;
        }
    }
    removed
}

fn swallow(operation: &'static str, error: &ExportError) {
    CacheMetrics::error(operation);
    warn!(operation, error = %error, "Export cache unavailable, continuing uncached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryExportHistory;
    use crate::job::{ExportPayload, JobId, JobOptions, TASK_EXPORT_JOB};
    use crate::source::MemoryTaskSource;
    use crate::store::MemoryStore;
    use tasktrack_core::{Task, TaskPriority, TaskStatus};

    struct Fixture {
        cache: ExportCacheService,
        source: Arc<MemoryTaskSource>,
        store: Arc<MemoryStore>,
        history: Arc<MemoryExportHistory>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let history = Arc::new(MemoryExportHistory::new());
        let source = Arc::new(MemoryTaskSource::with_tasks(vec![
            Task::new("a", TaskPriority::High),
            Task::new("b", TaskPriority::Low).with_status(TaskStatus::Done),
        ]));
        let cache = ExportCacheService::new(
            store.clone(),
            StoreKeys::new("t"),
            history.clone(),
            source.clone(),
            CacheConfig::default(),
        );
        Fixture {
            cache,
            source,
            store,
            history,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn job(filter: TaskFilter) -> Job {
        let payload = ExportPayload {
            format: ExportFormat::Csv,
            filter,
            requester_id: "u".into(),
        };
        Job::new(JobId::new(), TASK_EXPORT_JOB, payload, JobOptions::default())
    }

    async fn artifact(dir: &tempfile::TempDir, name: &str, total: u64) -> ExportArtifact {
        let path = dir.path().join(name);
        tokio::fs::write(&path, b"id\n").await.unwrap();
        ExportArtifact {
            filename: name.to_string(),
            artifact_path: path,
            file_size_bytes: 3,
            total_items: total,
            from_cache: false,
        }
    }

    #[test]
    fn test_ttl_class_threshold() {
        let f = fixture();
        assert_eq!(f.cache.ttl_class(1500), TtlClass::Extended);
        assert_eq!(f.cache.ttl_class(500), TtlClass::Standard);
        assert_eq!(f.cache.ttl_class(1000), TtlClass::Standard);
        assert!(f.cache.ttl_for(TtlClass::Extended) > f.cache.ttl_for(TtlClass::Standard));
    }

    #[tokio::test]
    async fn test_store_then_lookup_hits_ephemeral_then_durable() {
        let f = fixture();
        let filter = TaskFilter::default();
        let key = f.cache.key_for(&filter, ExportFormat::Csv).await.unwrap();
        assert!(f.cache.lookup(&key).await.is_none());

        let job = job(filter.clone());
        f.cache.begin(&key, &job).await;
        let artifact = artifact(&f.dir, "a.csv", 2).await;
        f.cache.store(&key, &job, &artifact).await;

        let hit = f.cache.lookup(&key).await.unwrap();
        assert_eq!(hit.job_id, job.id.to_string());
        assert_eq!(hit.total_records, 2);

        let storage_key = f.cache.storage_key(&key);
        f.store.del(&storage_key).await.unwrap();
        let promoted = f.cache.lookup(&key).await.unwrap();
        assert_eq!(promoted.filename, "a.csv");
        assert!(f.store.get(&storage_key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lookup_misses_when_artifact_deleted() {
        let f = fixture();
        let filter = TaskFilter::default();
        let key = f.cache.key_for(&filter, ExportFormat::Csv).await.unwrap();
        let job = job(filter);
        let artifact = artifact(&f.dir, "gone.csv", 2).await;
        f.cache.store(&key, &job, &artifact).await;

        tokio::fs::remove_file(&artifact.artifact_path).await.unwrap();
        assert!(f.cache.lookup(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_mutation_changes_key() {
        let f = fixture();
        let filter = TaskFilter::default();
        let before = f.cache.key_for(&filter, ExportFormat::Csv).await.unwrap();
        f.source.insert(Task::new("c", TaskPriority::Medium).with_timestamps(
            Utc::now() + chrono::Duration::seconds(5),
            Utc::now() + chrono::Duration::seconds(5),
        ));
        let after = f.cache.key_for(&filter, ExportFormat::Csv).await.unwrap();
        assert_ne!(before.digest, after.digest);
    }

    #[tokio::test]
    async fn test_invalidation_is_selective() {
        let f = fixture();
        let todo = TaskFilter {
            status: Some(vec![TaskStatus::Todo]),
            ..Default::default()
        };
        let done = TaskFilter {
            status: Some(vec![TaskStatus::Done]),
            ..Default::default()
        };
        let everything = TaskFilter::default();

        let mut paths = Vec::new();
        for (i, filter) in [todo, done, everything].into_iter().enumerate() {
            let key = f.cache.key_for(&filter, ExportFormat::Csv).await.unwrap();
            let job = job(filter);
            let artifact = artifact(&f.dir, &format!("{}.csv", i), 1).await;
            paths.push(artifact.artifact_path.clone());
            f.cache.store(&key, &job, &artifact).await;
        }
        assert_eq!(f.history.len(), 3);

        let task = Task::new("new", TaskPriority::Low);
        let report = f.cache.invalidate_for_mutation(&TaskMutation::created(&task)).await;

        assert_eq!(report.ephemeral_removed, 2);
        assert_eq!(report.durable_removed, 2);
        assert_eq!(report.artifacts_removed, 2);
        assert!(!artifact_exists(&paths[0]).await);
        assert!(artifact_exists(&paths[1]).await);
        assert!(!artifact_exists(&paths[2]).await);
        assert_eq!(f.history.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let store = Arc::new(MemoryStore::new());
        let history = Arc::new(MemoryExportHistory::new());
        let cache = ExportCacheService::new(
            store.clone(),
            StoreKeys::new("t"),
            history.clone(),
            Arc::new(MemoryTaskSource::new()),
            CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
        );
        let key = cache.key_for(&TaskFilter::default(), ExportFormat::Json).await.unwrap();
        let job = job(TaskFilter::default());
        let dir = tempfile::tempdir().unwrap();
        cache.store(&key, &job, &artifact(&dir, "x.json", 0).await).await;
        assert!(cache.lookup(&key).await.is_none());
        assert!(history.is_empty());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired_removes_artifacts() {
        let f = fixture();
        let path = f.dir.path().join("old.csv");
        tokio::fs::write(&path, b"x").await.unwrap();
        let mut record = super::super::history::sample_record("old", "all", "all");
        record.status = JobStatus::Completed;
        record.artifact_path = Some(path.clone());
        record.expires_at = Utc::now() - chrono::Duration::seconds(1);
        f.history.insert(&record).await.unwrap();

        assert_eq!(f.cache.purge_expired().await, 1);
        assert!(!artifact_exists(&path).await);
    }
}
