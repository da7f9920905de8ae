//! Export job model and its persisted field layout.

use crate::error::{ExportError, ExportResult};
use crate::filter::TaskFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Job type for task exports.
pub const TASK_EXPORT_JOB: &str = "task-export";

/// Lowest accepted job priority.
pub const MIN_PRIORITY: i64 = -100;

/// Highest accepted job priority.
pub const MAX_PRIORITY: i64 = 100;

/// Weight of one priority step in the dispatch score. Larger than any
/// millisecond timestamp, so priority always dominates enqueue time.
pub const PRIORITY_WEIGHT: f64 = 10_000_000_000_000.0;

/// Dispatch score for the pending set. Lower scores dispatch first.
pub fn dispatch_score(priority: i64, added_at_ms: i64) -> f64 {
    -(priority as f64) * PRIORITY_WEIGHT + added_at_ms as f64
}

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used in artifact filenames.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job status.
///
/// ```text
/// pending ──► processing ──► completed | failed | cancelled
///   │            │  ▲
///   │            ▼  │ resume
///   │          paused ──► cancelled
///   ▼
/// cancelled
/// ```
///
/// `processing → pending` covers crash recovery and stalled-job requeue;
/// `paused → pending` is a resume whose run already exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the pending set.
    #[default]
    Pending,
    /// Claimed by a dispatcher.
    Processing,
    /// Suspended with a checkpoint.
    Paused,
    /// Finished with an artifact.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by request.
    Cancelled,
}

impl JobStatus {
    /// Every status.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns the persisted name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true for states no transition leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns true for states shown in the active-jobs snapshot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Paused)
    }

    /// Returns true if the state machine allows `self → next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Paused)
                | (Processing, Cancelled)
                | (Processing, Pending)
                | (Paused, Processing)
                | (Paused, Pending)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ExportError::validation(format!("unknown job status '{}'", s)))
    }
}

/// Output format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    /// Returns the format name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }

    /// File extension for artifacts.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// MIME type for downloads.
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(ExportError::validation(format!(
                "unsupported export format '{}'",
                other
            ))),
        }
    }
}

/// What to export and for whom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayload {
    pub format: ExportFormat,
    #[serde(default)]
    pub filter: TaskFilter,
    pub requester_id: String,
}

/// Enqueue options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Higher runs first. Must be within `MIN_PRIORITY..=MAX_PRIORITY`.
    pub priority: i64,
    /// Recorded on the job. A failed run is final whatever this allows;
    /// only restarts and stall recovery consume further attempts.
    pub max_attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 1,
        }
    }
}

impl JobOptions {
    /// Rejects out-of-range options.
    pub fn validate(&self) -> ExportResult<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(ExportError::validation(format!(
                "priority {} outside {}..={}",
                self.priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }
        if self.max_attempts == 0 {
            return Err(ExportError::validation("maxAttempts must be at least 1"));
        }
        Ok(())
    }
}

/// Items written so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub processed_items: u64,
    pub total_items: u64,
}

impl JobProgress {
    /// Completion percentage, clamped to 100. An empty export is 100%.
    pub fn percent(&self) -> u8 {
        if self.total_items == 0 {
            return 100;
        }
        let pct = self.processed_items.saturating_mul(100) / self.total_items;
        pct.min(100) as u8
    }
}

/// Durable marker of partial progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCheckpoint {
    pub last_checkpoint_items: u64,
    pub last_checkpoint_file_size: u64,
    pub temp_artifact_path: Option<PathBuf>,
}

impl JobCheckpoint {
    /// Returns true if a run has left something to resume from.
    pub fn exists(&self) -> bool {
        self.temp_artifact_path.is_some()
    }
}

/// A finished export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub filename: String,
    pub artifact_path: PathBuf,
    pub file_size_bytes: u64,
    pub total_items: u64,
    #[serde(default)]
    pub from_cache: bool,
}

/// Persisted field names. The atomic store scripts use the same names.
pub mod fields {
    pub const ID: &str = "id";
    pub const TYPE: &str = "type";
    pub const PAYLOAD: &str = "payload";
    pub const STATUS: &str = "status";
    pub const PRIORITY: &str = "priority";
    pub const ADDED_AT: &str = "addedAt";
    pub const STARTED_AT: &str = "startedAt";
    pub const COMPLETED_AT: &str = "completedAt";
    pub const FAILED_AT: &str = "failedAt";
    pub const PAUSED_AT: &str = "pausedAt";
    pub const CANCELLED_AT: &str = "cancelledAt";
    pub const RECOVERED_AT: &str = "recoveredAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const ATTEMPTS: &str = "attempts";
    pub const MAX_ATTEMPTS: &str = "maxAttempts";
    pub const PROCESSED_ITEMS: &str = "processedItems";
    pub const TOTAL_ITEMS: &str = "totalItems";
    pub const LAST_CHECKPOINT_ITEMS: &str = "lastCheckpointItems";
    pub const LAST_CHECKPOINT_FILE_SIZE: &str = "lastCheckpointFileSize";
    pub const TEMP_ARTIFACT_PATH: &str = "tempArtifactPath";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const CONNECTION_ID: &str = "connectionId";
}

/// Field list for a partial record write.
pub type FieldList = Vec<(String, String)>;

/// Builds a field list. Absent values are written as empty strings.
pub fn field(name: &str, value: impl ToString) -> (String, String) {
    (name.to_string(), value.to_string())
}

/// Millisecond timestamp as stored.
pub fn ts(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

fn opt_ts(at: Option<DateTime<Utc>>) -> String {
    at.map(ts).unwrap_or_default()
}

/// An export job as persisted in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub payload: ExportPayload,
    pub status: JobStatus,
    pub priority: i64,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: JobProgress,
    pub checkpoint: JobCheckpoint,
    pub result: Option<ExportArtifact>,
    pub error: Option<String>,
    pub connection_id: Option<String>,
}

impl Job {
    /// Creates a pending job.
    pub fn new(id: JobId, job_type: impl Into<String>, payload: ExportPayload, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_type: job_type.into(),
            payload,
            status: JobStatus::Pending,
            priority: options.priority,
            added_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            paused_at: None,
            cancelled_at: None,
            recovered_at: None,
            updated_at: now,
            attempts: 0,
            max_attempts: options.max_attempts,
            progress: JobProgress::default(),
            checkpoint: JobCheckpoint::default(),
            result: None,
            error: None,
            connection_id: None,
        }
    }

    /// Score in the pending set.
    pub fn dispatch_score(&self) -> f64 {
        dispatch_score(self.priority, self.added_at.timestamp_millis())
    }

    /// Time the job reached its terminal state.
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        let stamped = match self.status {
            JobStatus::Completed => self.completed_at,
            JobStatus::Failed => self.failed_at,
            JobStatus::Cancelled => self.cancelled_at,
            _ => None,
        };
        stamped.or(self.status.is_terminal().then_some(self.updated_at))
    }

    /// Returns true if no run has produced partial output yet.
    pub fn is_fresh(&self) -> bool {
        !self.checkpoint.exists() && self.progress.processed_items == 0
    }

    /// Every field of the record.
    pub fn to_fields(&self) -> ExportResult<FieldList> {
        let payload = serde_json::to_string(&self.payload)?;
        let result = match &self.result {
            Some(r) => serde_json::to_string(r)?,
            None => String::new(),
        };
        let temp_path = self
            .checkpoint
            .temp_artifact_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(vec![
            field(fields::ID, &self.id),
            field(fields::TYPE, &self.job_type),
            field(fields::PAYLOAD, payload),
            field(fields::STATUS, self.status),
            field(fields::PRIORITY, self.priority),
            field(fields::ADDED_AT, ts(self.added_at)),
            field(fields::STARTED_AT, opt_ts(self.started_at)),
            field(fields::COMPLETED_AT, opt_ts(self.completed_at)),
            field(fields::FAILED_AT, opt_ts(self.failed_at)),
            field(fields::PAUSED_AT, opt_ts(self.paused_at)),
            field(fields::CANCELLED_AT, opt_ts(self.cancelled_at)),
            field(fields::RECOVERED_AT, opt_ts(self.recovered_at)),
            field(fields::UPDATED_AT, ts(self.updated_at)),
            field(fields::ATTEMPTS, self.attempts),
            field(fields::MAX_ATTEMPTS, self.max_attempts),
            field(fields::PROCESSED_ITEMS, self.progress.processed_items),
            field(fields::TOTAL_ITEMS, self.progress.total_items),
            field(fields::LAST_CHECKPOINT_ITEMS, self.checkpoint.last_checkpoint_items),
            field(fields::LAST_CHECKPOINT_FILE_SIZE, self.checkpoint.last_checkpoint_file_size),
            field(fields::TEMP_ARTIFACT_PATH, temp_path),
            field(fields::RESULT, result),
            field(fields::ERROR, self.error.clone().unwrap_or_default()),
            field(fields::CONNECTION_ID, self.connection_id.clone().unwrap_or_default()),
        ])
    }

    /// Decodes a record read from `key`.
    pub fn from_fields(key: &str, map: &HashMap<String, String>) -> ExportResult<Self> {
        let reader = FieldReader { key, map };

        let payload: ExportPayload = serde_json::from_str(reader.required(fields::PAYLOAD)?)
            .map_err(|e| ExportError::malformed(key, format!("payload: {}", e)))?;
        let result = match reader.optional(fields::RESULT) {
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|e| ExportError::malformed(key, format!("result: {}", e)))?,
            ),
            None => None,
        };
        let status = reader
            .required(fields::STATUS)?
            .parse::<JobStatus>()
            .map_err(|e| ExportError::malformed(key, e.to_string()))?;
        let added_at = reader.required_ts(fields::ADDED_AT)?;

        Ok(Self {
            id: JobId::from_string(reader.required(fields::ID)?),
            job_type: reader.optional(fields::TYPE).unwrap_or(TASK_EXPORT_JOB).to_string(),
            payload,
            status,
            priority: reader.number(fields::PRIORITY)?,
            added_at,
            started_at: reader.optional_ts(fields::STARTED_AT)?,
            completed_at: reader.optional_ts(fields::COMPLETED_AT)?,
            failed_at: reader.optional_ts(fields::FAILED_AT)?,
            paused_at: reader.optional_ts(fields::PAUSED_AT)?,
            cancelled_at: reader.optional_ts(fields::CANCELLED_AT)?,
            recovered_at: reader.optional_ts(fields::RECOVERED_AT)?,
            updated_at: reader.optional_ts(fields::UPDATED_AT)?.unwrap_or(added_at),
            attempts: reader.number(fields::ATTEMPTS)?,
            max_attempts: reader.number::<u32>(fields::MAX_ATTEMPTS)?.max(1),
            progress: JobProgress {
                processed_items: reader.number(fields::PROCESSED_ITEMS)?,
                total_items: reader.number(fields::TOTAL_ITEMS)?,
            },
            checkpoint: JobCheckpoint {
                last_checkpoint_items: reader.number(fields::LAST_CHECKPOINT_ITEMS)?,
                last_checkpoint_file_size: reader.number(fields::LAST_CHECKPOINT_FILE_SIZE)?,
                temp_artifact_path: reader.optional(fields::TEMP_ARTIFACT_PATH).map(PathBuf::from),
            },
            result,
            error: reader.optional(fields::ERROR).map(str::to_string),
            connection_id: reader.optional(fields::CONNECTION_ID).map(str::to_string),
        })
    }
}

struct FieldReader<'a> {
    key: &'a str,
    map: &'a HashMap<String, String>,
}

impl<'a> FieldReader<'a> {
    fn optional(&self, name: &str) -> Option<&'a str> {
        self.map.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> ExportResult<&'a str> {
        self.optional(name)
            .ok_or_else(|| ExportError::malformed(self.key, format!("missing field '{}'", name)))
    }

    fn number<T: FromStr + Default>(&self, name: &str) -> ExportResult<T> {
        match self.optional(name) {
            None => Ok(T::default()),
            Some(raw) => raw.parse().map_err(|_| {
                ExportError::malformed(self.key, format!("field '{}' is not a number: {}", name, raw))
            }),
        }
    }

    fn optional_ts(&self, name: &str) -> ExportResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.optional(name) else {
            return Ok(None);
        };
        raw.parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| {
                ExportError::malformed(self.key, format!("field '{}' is not a timestamp: {}", name, raw))
            })
    }

    fn required_ts(&self, name: &str) -> ExportResult<DateTime<Utc>> {
        self.optional_ts(name)?
            .ok_or_else(|| ExportError::malformed(self.key, format!("missing field '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn payload() -> ExportPayload {
        ExportPayload {
            format: ExportFormat::Csv,
            filter: TaskFilter::default(),
            requester_id: "user-1".into(),
        }
    }

    fn as_map(fields: FieldList) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn test_higher_priority_scores_lower() {
        let early = dispatch_score(0, 100);
        let late_urgent = dispatch_score(5, 200);
        assert!(late_urgent < early);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        assert!(dispatch_score(3, 100) < dispatch_score(3, 101));
        assert!(dispatch_score(-3, 100) < dispatch_score(-3, 101));
    }

    #[test]
    fn test_score_keeps_millisecond_precision_at_extremes() {
        let now = Utc::now().timestamp_millis();
        assert!(dispatch_score(MAX_PRIORITY, now) < dispatch_score(MAX_PRIORITY, now + 1));
        assert!(dispatch_score(MIN_PRIORITY, now) < dispatch_score(MIN_PRIORITY, now + 1));
        assert!(dispatch_score(MIN_PRIORITY + 1, now + 10_000_000) < dispatch_score(MIN_PRIORITY, now));
    }

    #[test]
    fn test_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Paused));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            assert!(JobStatus::ALL.iter().all(|s| !terminal.can_transition_to(*s)));
        }
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!(" json ".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!(matches!("xlsx".parse::<ExportFormat>(), Err(ExportError::Validation(_))));
    }

    #[test]
    fn test_options_validation() {
        assert!(JobOptions::default().validate().is_ok());
        let too_high = JobOptions { priority: 101, max_attempts: 1 };
        assert!(too_high.validate().is_err());
        let no_attempts = JobOptions { priority: 0, max_attempts: 0 };
        assert!(no_attempts.validate().is_err());
    }

    #[test]
    fn test_fields_preserve_checkpoint_and_result() {
        let mut job = Job::new(JobId::new(), TASK_EXPORT_JOB, payload(), JobOptions::default());
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.progress = JobProgress { processed_items: 40, total_items: 40 };
        job.checkpoint = JobCheckpoint {
            last_checkpoint_items: 30,
            last_checkpoint_file_size: 1024,
            temp_artifact_path: Some(PathBuf::from("/tmp/x.csv")),
        };
        job.result = Some(ExportArtifact {
            filename: "tasks-export.csv".into(),
            artifact_path: PathBuf::from("/tmp/x.csv"),
            file_size_bytes: 2048,
            total_items: 40,
            from_cache: false,
        });

        let decoded = Job::from_fields("k", &as_map(job.to_fields().unwrap())).unwrap();
        assert_eq!(decoded.checkpoint, job.checkpoint);
        assert_eq!(decoded.result, job.result);
        assert_eq!(decoded.status, JobStatus::Completed);
        assert_eq!(decoded.added_at.timestamp_millis(), job.added_at.timestamp_millis());
        assert!(decoded.error.is_none());
        assert!(decoded.connection_id.is_none());
    }

    #[test]
    fn test_from_fields_rejects_malformed() {
        let job = Job::new(JobId::new(), TASK_EXPORT_JOB, payload(), JobOptions::default());

        let mut map = as_map(job.to_fields().unwrap());
        map.insert(fields::STATUS.into(), "exploded".into());
        assert!(matches!(Job::from_fields("k", &map), Err(ExportError::MalformedRecord { .. })));

        let mut map = as_map(job.to_fields().unwrap());
        map.remove(fields::PAYLOAD);
        assert!(matches!(Job::from_fields("k", &map), Err(ExportError::MalformedRecord { .. })));

        let mut map = as_map(job.to_fields().unwrap());
        map.insert(fields::ATTEMPTS.into(), "many".into());
        assert!(Job::from_fields("k", &map).is_err());
    }

    #[test]
    fn test_terminal_at() {
        let mut job = Job::new(JobId::new(), TASK_EXPORT_JOB, payload(), JobOptions::default());
        assert!(job.terminal_at().is_none());

        let done = Utc::now() - Duration::hours(25);
        job.status = JobStatus::Completed;
        job.completed_at = Some(done);
        assert_eq!(job.terminal_at(), Some(done));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(JobProgress { processed_items: 0, total_items: 0 }.percent(), 100);
        assert_eq!(JobProgress { processed_items: 1, total_items: 3 }.percent(), 33);
        assert_eq!(JobProgress { processed_items: 9, total_items: 3 }.percent(), 100);
    }

    #[test]
    fn test_short_id() {
        let id = JobId::from_string("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        assert_eq!(JobId::from_string("abc").short(), "abc");
    }
}
