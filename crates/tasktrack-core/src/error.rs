//! Unified error types for all layers of the application.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for TaskTrack.
///
/// Subsystem errors (such as export errors) convert into this type at the
/// presentation boundary so HTTP handlers can map them to responses.
#[derive(Error, Debug)]
pub enum TrackError {
    // ============ Domain Errors ============
    /// Resource not found
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound {
        resource_type: &'static str,
        id: String,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Conflict error (e.g., invalid state transition)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Resource existed but is no longer available
    #[error("Gone: {0}")]
    Gone(String),

    // ============ Infrastructure Errors ============
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Durable store error
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Redis/Cache error
    #[error("Cache error: {0}")]
    Cache(String),

    // ============ Internal Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrackError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Validation(_) => 400,
            Self::Conflict(_) => 409,
            Self::Gone(_) => 410,
            Self::StoreUnavailable(_) => 503,
            Self::Database(_)
            | Self::Configuration(_)
            | Self::Cache(_)
            | Self::Internal(_)
            | Self::Other(_) => 500,
        }
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Gone(_) => "GONE",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Cache(_) => "CACHE_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a not found error for a resource.
    #[must_use]
    pub fn not_found<T: ToString>(resource_type: &'static str, id: T) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict<T: Into<String>>(message: T) -> Self {
        Self::Conflict(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Checks if this error is retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::StoreUnavailable(_) | Self::Cache(_)
        )
    }
}

impl From<serde_json::Error> for TrackError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization error: {}", err))
    }
}

/// Serializable error response for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Request trace ID for debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ErrorResponse {
    /// Creates a new error response from a `TrackError`.
    #[must_use]
    pub fn from_error(error: &TrackError) -> Self {
        Self {
            code: error.error_code().to_string(),
            message: error.to_string(),
            trace_id: None,
        }
    }

    /// Sets the trace ID.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

impl From<&TrackError> for ErrorResponse {
    fn from(error: &TrackError) -> Self {
        Self::from_error(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(TrackError::not_found("Job", "abc").status_code(), 404);
        assert_eq!(TrackError::validation("bad format").status_code(), 400);
        assert_eq!(TrackError::conflict("already completed").status_code(), 409);
        assert_eq!(TrackError::Gone("artifact evicted".into()).status_code(), 410);
        assert_eq!(TrackError::StoreUnavailable("redis down".into()).status_code(), 503);
        assert_eq!(TrackError::internal("oops").status_code(), 500);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TrackError::not_found("Job", 1).error_code(), "NOT_FOUND");
        assert_eq!(TrackError::validation("x").error_code(), "VALIDATION_ERROR");
        assert_eq!(TrackError::Cache("x".into()).error_code(), "CACHE_ERROR");
        assert_eq!(TrackError::internal("x").error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_retriable_errors() {
        assert!(TrackError::StoreUnavailable("connection lost".into()).is_retriable());
        assert!(TrackError::Database("locked".into()).is_retriable());
        assert!(!TrackError::not_found("Job", 1).is_retriable());
        assert!(!TrackError::validation("bad").is_retriable());
    }

    #[test]
    fn test_error_response_from_error() {
        let err = TrackError::not_found("Job", "job-1");
        let response = ErrorResponse::from_error(&err).with_trace_id("trace-9");
        assert_eq!(response.code, "NOT_FOUND");
        assert!(response.message.contains("job-1"));
        assert_eq!(response.trace_id.as_deref(), Some("trace-9"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = TrackError::from(json_err);
        assert!(matches!(err, TrackError::Internal(msg) if msg.contains("JSON")));
    }
}
