//! Task change notifications.
//!
//! The task CRUD layer emits a [`TaskMutation`] after each write so dependent
//! subsystems (export caching) can react selectively.

use crate::{Task, TaskId, TaskPriority, TaskStatus};
use serde::{Deserialize, Serialize};

/// Kind of write that happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
}

/// The filterable facets of a task at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFacets {
    pub status: TaskStatus,
    pub priority: TaskPriority,
}

impl From<&Task> for TaskFacets {
    fn from(task: &Task) -> Self {
        Self {
            status: task.status,
            priority: task.priority,
        }
    }
}

/// A single write to a task, with its state before and after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMutation {
    pub kind: MutationKind,
    pub task_id: TaskId,
    pub before: Option<TaskFacets>,
    pub after: Option<TaskFacets>,
}

impl TaskMutation {
    /// A task was created.
    #[must_use]
    pub fn created(task: &Task) -> Self {
        Self {
            kind: MutationKind::Created,
            task_id: task.id,
            before: None,
            after: Some(task.into()),
        }
    }

    /// A task was modified.
    #[must_use]
    pub fn updated(before: &Task, after: &Task) -> Self {
        Self {
            kind: MutationKind::Updated,
            task_id: after.id,
            before: Some(before.into()),
            after: Some(after.into()),
        }
    }

    /// A task was removed.
    #[must_use]
    pub fn deleted(task: &Task) -> Self {
        Self {
            kind: MutationKind::Deleted,
            task_id: task.id,
            before: Some(task.into()),
            after: None,
        }
    }

    /// Every status the task had before or after the write, deduplicated.
    #[must_use]
    pub fn statuses(&self) -> Vec<TaskStatus> {
        let mut out: Vec<TaskStatus> = self.before.iter().chain(self.after.iter()).map(|f| f.status).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Every priority the task had before or after the write, deduplicated.
    #[must_use]
    pub fn priorities(&self) -> Vec<TaskPriority> {
        let mut out: Vec<TaskPriority> = self.before.iter().chain(self.after.iter()).map(|f| f.priority).collect();
        out.sort();
        out.dedup();
        out
    }
}
