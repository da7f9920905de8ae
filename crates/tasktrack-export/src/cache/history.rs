use super::{InvalidationScope, TtlClass};
use crate::error::ExportResult;
use crate::job::{ExportFormat, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Durable tier record, one per cache key.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportHistoryRecord {
    pub cache_key: String,
    pub job_id: String,
    /// `processing` while the export runs, then `completed` or `failed`.
    pub status: JobStatus,
    pub format: ExportFormat,
    pub filter_json: String,
    pub status_facet: String,
    pub priority_facet: String,
    pub filename: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub total_records: u64,
    pub file_size_bytes: u64,
    pub ttl_class: TtlClass,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Partial update applied by [`ExportHistoryStore::update_by_key`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryUpdate {
    pub status: Option<JobStatus>,
    pub filename: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub total_records: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub ttl_class: Option<TtlClass>,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl HistoryUpdate {
    fn apply(&self, record: &mut ExportHistoryRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(filename) = &self.filename {
            record.filename = Some(filename.clone());
        }
        if let Some(path) = &self.artifact_path {
            record.artifact_path = Some(path.clone());
        }
        if let Some(total) = self.total_records {
            record.total_records = total;
        }
        if let Some(size) = self.file_size_bytes {
            record.file_size_bytes = size;
        }
        if let Some(class) = self.ttl_class {
            record.ttl_class = class;
        }
        if let Some(created_at) = self.created_at {
            record.created_at = created_at;
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = expires_at;
        }
    }
}

/// Which records [`ExportHistoryStore::delete_many`] removes.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryPredicate {
    /// Records whose facets fall in the scope of a task mutation.
    Matching(InvalidationScope),
    /// Records that expired before the given instant.
    ExpiredBefore(DateTime<Utc>),
}

impl HistoryPredicate {
    pub fn test(&self, record: &ExportHistoryRecord) -> bool {
        match self {
            HistoryPredicate::Matching(scope) => scope.covers(&record.status_facet, &record.priority_facet),
            HistoryPredicate::ExpiredBefore(at) => record.expires_at < *at,
        }
    }
}

/// Durable tier record store.
#[async_trait]
pub trait ExportHistoryStore: Send + Sync {
    /// Inserts a record, replacing any record with the same key.
    async fn insert(&self, record: &ExportHistoryRecord) -> ExportResult<()>;

    /// Looks a record up by cache key.
    async fn find_by_key(&self, cache_key: &str) -> ExportResult<Option<ExportHistoryRecord>>;

    /// Applies a partial update. Returns false if no record has the key.
    async fn update_by_key(&self, cache_key: &str, update: &HistoryUpdate) -> ExportResult<bool>;

    /// Removes every record the predicate selects and returns them.
    async fn delete_many(&self, predicate: &HistoryPredicate) -> ExportResult<Vec<ExportHistoryRecord>>;

    /// Returns true if any record points at `path`.
    async fn references_artifact(&self, path: &Path) -> ExportResult<bool>;
}

/// In-process history store.
#[derive(Debug, Default)]
pub struct MemoryExportHistory {
    records: Mutex<HashMap<String, ExportHistoryRecord>>,
}

impl MemoryExportHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ExportHistoryStore for MemoryExportHistory {
    async fn insert(&self, record: &ExportHistoryRecord) -> ExportResult<()> {
        self.records
            .lock()
            .insert(record.cache_key.clone(), record.clone());
        Ok(())
    }

    async fn find_by_key(&self, cache_key: &str) -> ExportResult<Option<ExportHistoryRecord>> {
        Ok(self.records.lock().get(cache_key).cloned())
    }

    async fn update_by_key(&self, cache_key: &str, update: &HistoryUpdate) -> ExportResult<bool> {
        Ok(match self.records.lock().get_mut(cache_key) {
            Some(record) => {
                update.apply(record);
                true
            }
            None => false,
        })
    }

    async fn delete_many(&self, predicate: &HistoryPredicate) -> ExportResult<Vec<ExportHistoryRecord>> {
        let mut records = self.records.lock();
        let doomed: Vec<String> = records
            .values()
            .filter(|r| predicate.test(r))
            .map(|r| r.cache_key.clone())
            .collect();
        Ok(doomed.iter().filter_map(|k| records.remove(k)).collect())
    }

    async fn references_artifact(&self, path: &Path) -> ExportResult<bool> {
        Ok(self
            .records
            .lock()
            .values()
            .any(|r| r.artifact_path.as_deref() == Some(path)))
    }
}

#[cfg(test)]
pub(crate) fn sample_record(key: &str, status_facet: &str, priority_facet: &str) -> ExportHistoryRecord {
    let now = Utc::now();
    ExportHistoryRecord {
        cache_key: key.to_string(),
        job_id: format!("job-{}", key),
        status: JobStatus::Processing,
        format: ExportFormat::Csv,
        filter_json: "{}".to_string(),
        status_facet: status_facet.to_string(),
        priority_facet: priority_facet.to_string(),
        filename: None,
        artifact_path: None,
        total_records: 0,
        file_size_bytes: 0,
        ttl_class: TtlClass::Standard,
        created_at: now,
        expires_at: now + chrono::Duration::minutes(15),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_by_key() {
        let history = MemoryExportHistory::new();
        history.insert(&sample_record("a", "all", "all")).await.unwrap();

        let update = HistoryUpdate {
            status: Some(JobStatus::Completed),
            filename: Some("out.csv".into()),
            total_records: Some(12),
            ..Default::default()
        };
        assert!(history.update_by_key("a", &update).await.unwrap());
        assert!(!history.update_by_key("missing", &update).await.unwrap());

        let record = history.find_by_key("a").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.filename.as_deref(), Some("out.csv"));
        assert_eq!(record.total_records, 12);
        assert_eq!(record.ttl_class, TtlClass::Standard);
    }

    #[tokio::test]
    async fn test_delete_many_by_scope_and_expiry() {
        let history = MemoryExportHistory::new();
        history.insert(&sample_record("todo", "todo", "all")).await.unwrap();
        history.insert(&sample_record("done", "done", "high")).await.unwrap();
        let mut stale = sample_record("stale", "in_progress", "all");
        stale.expires_at = Utc::now() - chrono::Duration::minutes(1);
        history.insert(&stale).await.unwrap();

        let scope = InvalidationScope {
            statuses: vec!["todo".into()],
            priorities: vec!["low".into()],
        };
        let removed = history.delete_many(&HistoryPredicate::Matching(scope)).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].cache_key, "todo");

        let expired = history
            .delete_many(&HistoryPredicate::ExpiredBefore(Utc::now()))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].cache_key, "stale");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_references_artifact() {
        let history = MemoryExportHistory::new();
        let mut record = sample_record("a", "all", "all");
        record.artifact_path = Some(PathBuf::from("/exports/a.csv"));
        history.insert(&record).await.unwrap();

        assert!(history.references_artifact(Path::new("/exports/a.csv")).await.unwrap());
        assert!(!history.references_artifact(Path::new("/exports/b.csv")).await.unwrap());
    }
}
