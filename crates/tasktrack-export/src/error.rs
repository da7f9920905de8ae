//! Export error types.

use crate::job::JobStatus;
use tasktrack_core::TrackError;
use thiserror::Error;

/// Result type for export operations.
pub type ExportResult<T> = Result<T, ExportError>;

/// Export-related errors.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Malformed submission. Rejected before anything is enqueued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A durable store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Query, stream, or artifact write failure while exporting.
    #[error("Export execution failed: {0}")]
    Execution(String),

    /// Either cache tier is unavailable.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The artifact behind a completed job no longer exists.
    #[error("Artifact gone: {0}")]
    Gone(String),

    /// The job has not produced an artifact yet.
    #[error("Export not ready: {0}")]
    NotReady(String),

    /// Requested status change is not allowed from the current status.
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// A persisted job record could not be decoded.
    #[error("Malformed record {key}: {reason}")]
    MalformedRecord { key: String, reason: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV encoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] csv::Error),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ExportError {
    /// Returns true for store failures the dispatcher should back off and retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExportError::Store(_) | ExportError::Redis(_) | ExportError::Pool(_)
        )
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        ExportError::Validation(message.into())
    }

    /// Creates a malformed record error.
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ExportError::MalformedRecord {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<ExportError> for TrackError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::Validation(msg) => TrackError::Validation(msg),
            ExportError::NotFound(id) => TrackError::not_found("ExportJob", id),
            ExportError::InvalidTransition { .. } | ExportError::NotReady(_) => {
                TrackError::Conflict(err.to_string())
            }
            ExportError::Gone(msg) => TrackError::Gone(msg),
            ExportError::Store(_) | ExportError::Redis(_) | ExportError::Pool(_) => {
                TrackError::StoreUnavailable(err.to_string())
            }
            ExportError::Cache(msg) => TrackError::Cache(msg),
            ExportError::Database(e) => TrackError::Database(e.to_string()),
            ExportError::Configuration(msg) => TrackError::Configuration(msg),
            other => TrackError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_transient() {
        assert!(ExportError::Store("connection reset".into()).is_transient());
        assert!(!ExportError::Execution("disk full".into()).is_transient());
        assert!(!ExportError::validation("bad format").is_transient());
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = ExportError::InvalidTransition {
            job_id: "job-1".into(),
            from: JobStatus::Completed,
            to: JobStatus::Paused,
        };
        let msg = err.to_string();
        assert!(msg.contains("completed") && msg.contains("paused"));
    }

    #[test]
    fn test_maps_to_track_error() {
        let err: TrackError = ExportError::NotFound("job-9".into()).into();
        assert_eq!(err.status_code(), 404);

        let err: TrackError = ExportError::InvalidTransition {
            job_id: "job-1".into(),
            from: JobStatus::Failed,
            to: JobStatus::Processing,
        }
        .into();
        assert_eq!(err.status_code(), 409);

        let err: TrackError = ExportError::Store("down".into()).into();
        assert_eq!(err.status_code(), 503);

        let err: TrackError = ExportError::Gone("evicted".into()).into();
        assert_eq!(err.status_code(), 410);

        let err: TrackError = ExportError::validation("empty search").into();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_malformed_record_display() {
        let err = ExportError::malformed("export:job:1", "missing status");
        assert!(err.to_string().contains("missing status"));
    }
}
