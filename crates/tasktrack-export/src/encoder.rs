//! Artifact encodings.
//!
//! Both encodings are streamable: a header, any number of independently
//! encoded batches, and a footer. A batch's bytes depend only on its rows
//! and its position, so a resumed run appends exactly what the original
//! run would have written.

use crate::error::{ExportError, ExportResult};
use crate::job::ExportFormat;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tasktrack_core::Task;

/// CSV column names, in row order.
pub const CSV_COLUMNS: [&str; 9] = [
    "id",
    "title",
    "description",
    "status",
    "priority",
    "assignee",
    "dueDate",
    "createdAt",
    "updatedAt",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportRow<'a> {
    id: String,
    title: &'a str,
    description: Option<&'a str>,
    status: &'static str,
    priority: &'static str,
    assignee: Option<&'a str>,
    due_date: Option<String>,
    created_at: String,
    updated_at: String,
}

impl<'a> From<&'a Task> for ExportRow<'a> {
    fn from(task: &'a Task) -> Self {
        Self {
            id: task.id.to_string(),
            title: &task.title,
            description: task.description.as_deref(),
            status: task.status.as_str(),
            priority: task.priority.as_str(),
            assignee: task.assignee.as_deref(),
            due_date: task.due_date.map(rfc3339),
            created_at: rfc3339(task.created_at),
            updated_at: rfc3339(task.updated_at),
        }
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Encodes tasks for one export format.
#[derive(Debug, Clone, Copy)]
pub struct RecordEncoder {
    format: ExportFormat,
}

impl RecordEncoder {
    pub fn new(format: ExportFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    /// Bytes written before the first row.
    pub fn header(&self) -> ExportResult<Vec<u8>> {
        match self.format {
            ExportFormat::Csv => {
                let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
                writer.write_record(CSV_COLUMNS)?;
                into_bytes(writer)
            }
            ExportFormat::Json => Ok(b"[".to_vec()),
        }
    }

    /// Encodes a batch whose first row is row number `first_index` overall.
    pub fn encode_batch(&self, tasks: &[Task], first_index: u64) -> ExportResult<Vec<u8>> {
        match self.format {
            ExportFormat::Csv => {
                let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
                for task in tasks {
                    writer.serialize(ExportRow::from(task))?;
                }
                into_bytes(writer)
            }
            ExportFormat::Json => {
                let mut out = Vec::new();
                for (offset, task) in tasks.iter().enumerate() {
                    let separator: &[u8] = if first_index + offset as u64 == 0 { b"\n" } else { b",\n" };
                    out.extend_from_slice(separator);
                    serde_json::to_writer(&mut out, &ExportRow::from(task))?;
                }
                Ok(out)
            }
        }
    }

    /// Bytes written after the last row.
    pub fn footer(&self, total_rows: u64) -> Vec<u8> {
        match self.format {
            ExportFormat::Csv => Vec::new(),
            ExportFormat::Json if total_rows == 0 => b"]".to_vec(),
            ExportFormat::Json => b"\n]\n".to_vec(),
        }
    }
}

fn into_bytes(writer: csv::Writer<Vec<u8>>) -> ExportResult<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| ExportError::Execution(format!("failed to flush CSV buffer: {}", e)))
}
