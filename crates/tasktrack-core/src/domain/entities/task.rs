//! Task entity.

use super::super::value_objects::{TaskPriority, TaskStatus};
use crate::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked unit of work.
///
/// Tasks are owned by the CRUD layer; the export subsystem only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for the task.
    pub id: TaskId,

    /// Short title.
    pub title: String,

    /// Optional long-form description.
    pub description: Option<String>,

    /// Workflow status.
    pub status: TaskStatus,

    /// Priority.
    pub priority: TaskPriority,

    /// Assigned user, if any.
    pub assignee: Option<String>,

    /// Due date, if any.
    pub due_date: Option<DateTime<Utc>>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new task in the `todo` state.
    #[must_use]
    pub fn new(title: impl Into<String>, priority: TaskPriority) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            title: title.into(),
            description: None,
            status: TaskStatus::Todo,
            priority,
            assignee: None,
            due_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the assignee.
    #[must_use]
    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the due date.
    #[must_use]
    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    /// Overrides both timestamps.
    #[must_use]
    pub fn with_timestamps(mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    /// Marks the task as modified now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
