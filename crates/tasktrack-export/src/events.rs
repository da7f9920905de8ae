//! Gateway wire protocol.
//!
//! Events flow server → client, commands client → server. Both are JSON
//! objects tagged by `event` / `command`.

use crate::job::{ExportFormat, Job, JobId, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client-facing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub priority: i64,
    pub format: ExportFormat,
    pub processed_items: u64,
    pub total_items: u64,
    pub percent: u8,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Download filename once the export has completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the job was found silent past the stall threshold.
    #[serde(default)]
    pub stalled: bool,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            priority: job.priority,
            format: job.payload.format,
            processed_items: job.progress.processed_items,
            total_items: job.progress.total_items,
            percent: job.progress.percent(),
            added_at: job.added_at,
            updated_at: job.updated_at,
            filename: job.result.as_ref().map(|r| r.filename.clone()),
            error: job.error.clone(),
            stalled: false,
        }
    }
}

/// Server → client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ExportEvent {
    Connected {
        connection_id: String,
    },
    JobCreated {
        job_id: JobId,
        priority: i64,
        format: ExportFormat,
    },
    Progress {
        job_id: JobId,
        status: JobStatus,
        processed_items: u64,
        total_items: u64,
        percent: u8,
    },
    Completed {
        job_id: JobId,
        filename: String,
        file_size_bytes: u64,
        total_items: u64,
        from_cache: bool,
    },
    Failed {
        job_id: JobId,
        error: String,
    },
    Paused {
        job_id: JobId,
        processed_items: u64,
    },
    Cancelled {
        job_id: JobId,
    },
    ActiveJobsSnapshot {
        jobs: Vec<JobSnapshot>,
    },
    Status {
        job: JobSnapshot,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        message: String,
    },
}

impl ExportEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ExportEvent::Connected { .. } => "connected",
            ExportEvent::JobCreated { .. } => "job-created",
            ExportEvent::Progress { .. } => "progress",
            ExportEvent::Completed { .. } => "completed",
            ExportEvent::Failed { .. } => "failed",
            ExportEvent::Paused { .. } => "paused",
            ExportEvent::Cancelled { .. } => "cancelled",
            ExportEvent::ActiveJobsSnapshot { .. } => "active-jobs-snapshot",
            ExportEvent::Status { .. } => "status",
            ExportEvent::Error { .. } => "error",
        }
    }

    /// `completed` event for a finished job, if it has a result.
    pub fn completed(job: &Job) -> Option<Self> {
        let result = job.result.as_ref()?;
        Some(ExportEvent::Completed {
            job_id: job.id.clone(),
            filename: result.filename.clone(),
            file_size_bytes: result.file_size_bytes,
            total_items: result.total_items,
            from_cache: result.from_cache,
        })
    }
}

/// Client → server command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum GatewayCommand {
    Pause { job_id: JobId },
    Resume { job_id: JobId },
    Cancel { job_id: JobId },
    GetStatus { job_id: JobId },
    Reconnect { previous_connection_id: String },
}

impl GatewayCommand {
    /// Job the command targets, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            GatewayCommand::Pause { job_id }
            | GatewayCommand::Resume { job_id }
            | GatewayCommand::Cancel { job_id }
            | GatewayCommand::GetStatus { job_id } => Some(job_id),
            GatewayCommand::Reconnect { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event = ExportEvent::Progress {
            job_id: JobId::from_string("j1"),
            status: JobStatus::Processing,
            processed_items: 50,
            total_items: 200,
            percent: 25,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "progress", "jobId": "j1", "status": "processing", "processedItems": 50, "totalItems": 200, "percent": 25})
        );
        assert_eq!(event.name(), "progress");
    }

    #[test]
    fn test_command_parsing() {
        let cmd: GatewayCommand = serde_json::from_str(r#"{"command":"get-status","jobId":"j9"}"#).unwrap();
        assert_eq!(cmd, GatewayCommand::GetStatus { job_id: JobId::from_string("j9") });

        let cmd: GatewayCommand =
            serde_json::from_str(r#"{"command":"reconnect","previousConnectionId":"c1"}"#).unwrap();
        assert!(cmd.job_id().is_none());

        assert!(serde_json::from_str::<GatewayCommand>(r#"{"command":"explode"}"#).is_err());
    }

    #[test]
    fn test_status_snapshot_carries_result_filename() {
        use crate::filter::TaskFilter;
        use crate::job::{ExportArtifact, ExportPayload, JobOptions, TASK_EXPORT_JOB};

        let payload = ExportPayload {
            format: ExportFormat::Csv,
            filter: TaskFilter::default(),
            requester_id: "user-1".into(),
        };
        let mut job = Job::new(JobId::from_string("j"), TASK_EXPORT_JOB, payload, JobOptions::default());
        let pending = serde_json::to_value(JobSnapshot::from(&job)).unwrap();
        assert!(pending.get("filename").is_none());

        job.status = JobStatus::Completed;
        job.result = Some(ExportArtifact {
            filename: "f.csv".into(),
            artifact_path: "/tmp/f.csv".into(),
            file_size_bytes: 10,
            total_items: 2,
            from_cache: false,
        });
        let value = serde_json::to_value(ExportEvent::Status { job: (&job).into() }).unwrap();
        assert_eq!(value["event"], "status");
        assert_eq!(value["job"]["status"], "completed");
        assert_eq!(value["job"]["percent"], 0);
        assert_eq!(value["job"]["filename"], "f.csv");
    }

    #[test]
    fn test_snapshot_event_name() {
        let event = ExportEvent::ActiveJobsSnapshot { jobs: vec![] };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "active-jobs-snapshot");
    }
}
