//! Result type aliases for TaskTrack.

use crate::TrackError;

/// A specialized `Result` type for TaskTrack operations.
pub type TrackResult<T> = Result<T, TrackError>;
