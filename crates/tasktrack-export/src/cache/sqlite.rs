use super::history::{ExportHistoryRecord, ExportHistoryStore, HistoryPredicate, HistoryUpdate};
use crate::error::{ExportError, ExportResult};
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::path::{Path, PathBuf};
use tracing::debug;

const SELECT_COLUMNS: &str = "SELECT cache_key, job_id, status, format, filter_json, status_facet, \
     priority_facet, filename, artifact_path, total_records, file_size_bytes, ttl_class, \
     created_at, expires_at FROM export_history";

/// History store backed by the `export_history` table.
#[derive(Debug, Clone)]
pub struct SqliteExportHistory {
    pool: SqlitePool,
}

impl SqliteExportHistory {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Database row representation of a history record.
#[derive(Debug, FromRow)]
struct HistoryRow {
    cache_key: String,
    job_id: String,
    status: String,
    format: String,
    filter_json: String,
    status_facet: String,
    priority_facet: String,
    filename: Option<String>,
    artifact_path: Option<String>,
    total_records: i64,
    file_size_bytes: i64,
    ttl_class: String,
    created_at: i64,
    expires_at: i64,
}

impl TryFrom<HistoryRow> for ExportHistoryRecord {
    type Error = ExportError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let key = format!("export_history/{}", row.cache_key);
        let millis = |ms: i64| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| ExportError::malformed(&key, format!("timestamp out of range: {}", ms)))
        };

        Ok(ExportHistoryRecord {
            status: row.status.parse().map_err(|e: ExportError| ExportError::malformed(&key, e.to_string()))?,
            format: row.format.parse().map_err(|e: ExportError| ExportError::malformed(&key, e.to_string()))?,
            ttl_class: row.ttl_class.parse()?,
            created_at: millis(row.created_at)?,
            expires_at: millis(row.expires_at)?,
            total_records: u64::try_from(row.total_records).unwrap_or_default(),
            file_size_bytes: u64::try_from(row.file_size_bytes).unwrap_or_default(),
            artifact_path: row.artifact_path.map(PathBuf::from),
            cache_key: row.cache_key,
            job_id: row.job_id,
            filter_json: row.filter_json,
            status_facet: row.status_facet,
            priority_facet: row.priority_facet,
            filename: row.filename,
        })
    }
}

fn path_text(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl ExportHistoryStore for SqliteExportHistory {
    async fn insert(&self, record: &ExportHistoryRecord) -> ExportResult<()> {
        debug!(cache_key = %record.cache_key, job_id = %record.job_id, "Inserting export history record");

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO export_history (
                cache_key, job_id, status, format, filter_json, status_facet, priority_facet,
                filename, artifact_path, total_records, file_size_bytes, ttl_class,
                created_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.cache_key)
        .bind(&record.job_id)
        .bind(record.status.as_str())
        .bind(record.format.as_str())
        .bind(&record.filter_json)
        .bind(&record.status_facet)
        .bind(&record.priority_facet)
        .bind(&record.filename)
        .bind(path_text(&record.artifact_path))
        .bind(to_i64(record.total_records))
        .bind(to_i64(record.file_size_bytes))
        .bind(record.ttl_class.as_str())
        .bind(record.created_at.timestamp_millis())
        .bind(record.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_key(&self, cache_key: &str) -> ExportResult<Option<ExportHistoryRecord>> {
        let row = sqlx::query_as::<_, HistoryRow>(&format!("{} WHERE cache_key = ?", SELECT_COLUMNS))
            .bind(cache_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ExportHistoryRecord::try_from).transpose()
    }

    async fn update_by_key(&self, cache_key: &str, update: &HistoryUpdate) -> ExportResult<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE export_history SET cache_key = cache_key");
        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(filename) = &update.filename {
            qb.push(", filename = ").push_bind(filename.clone());
        }
        if update.artifact_path.is_some() {
            qb.push(", artifact_path = ").push_bind(path_text(&update.artifact_path));
        }
        if let Some(total) = update.total_records {
            qb.push(", total_records = ").push_bind(to_i64(total));
        }
        if let Some(size) = update.file_size_bytes {
            qb.push(", file_size_bytes = ").push_bind(to_i64(size));
        }
        if let Some(class) = update.ttl_class {
            qb.push(", ttl_class = ").push_bind(class.as_str());
        }
        if let Some(created_at) = update.created_at {
            qb.push(", created_at = ").push_bind(created_at.timestamp_millis());
        }
        if let Some(expires_at) = update.expires_at {
            qb.push(", expires_at = ").push_bind(expires_at.timestamp_millis());
        }
        qb.push(" WHERE cache_key = ").push_bind(cache_key.to_string());

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_many(&self, predicate: &HistoryPredicate) -> ExportResult<Vec<ExportHistoryRecord>> {
        let mut tx = self.pool.begin().await?;

        let rows = match predicate {
            HistoryPredicate::ExpiredBefore(at) => {
                sqlx::query_as::<_, HistoryRow>(&format!("{} WHERE expires_at < ?", SELECT_COLUMNS))
                    .bind(at.timestamp_millis())
                    .fetch_all(&mut *tx)
                    .await?
            }
            HistoryPredicate::Matching(_) => {
                sqlx::query_as::<_, HistoryRow>(SELECT_COLUMNS)
                    .fetch_all(&mut *tx)
                    .await?
            }
        };

        let mut removed = Vec::new();
        for row in rows {
            let record = ExportHistoryRecord::try_from(row)?;
            if !predicate.test(&record) {
                continue;
            }
            sqlx::query("DELETE FROM export_history WHERE cache_key = ?")
                .bind(&record.cache_key)
                .execute(&mut *tx)
                .await?;
            removed.push(record);
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn references_artifact(&self, path: &Path) -> ExportResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM export_history WHERE artifact_path = ? LIMIT 1")
            .bind(path.to_string_lossy().into_owned())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}
