use super::TaskSource;
use crate::error::ExportResult;
use crate::filter::TaskFilter;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tasktrack_core::{Task, TaskId, TaskMutation};

/// Task source over an in-process list.
///
/// Writes return the [`TaskMutation`] the CRUD layer would emit, so callers
/// can forward it to the export cache.
#[derive(Debug, Default)]
pub struct MemoryTaskSource {
    tasks: RwLock<Vec<Task>>,
    batch_delay: Option<Duration>,
}

impl MemoryTaskSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source holding `tasks`.
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: RwLock::new(tasks),
            batch_delay: None,
        }
    }

    /// Sleeps before every batch, simulating a slow backing store.
    #[must_use]
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = Some(delay);
        self
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Returns true if no tasks are stored.
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Stores a new task.
    pub fn insert(&self, task: Task) -> TaskMutation {
        let mutation = TaskMutation::created(&task);
        self.tasks.write().push(task);
        mutation
    }

    /// Replaces a task, bumping its `updated_at` strictly past the previous
    /// value. Returns `None` if the task does not exist.
    pub fn update(&self, mut task: Task) -> Option<TaskMutation> {
        let mut tasks = self.tasks.write();
        let slot = tasks.iter_mut().find(|t| t.id == task.id)?;
        task.updated_at = next_update(slot.updated_at);
        let mutation = TaskMutation::updated(slot, &task);
        *slot = task;
        Some(mutation)
    }

    /// Removes a task. Returns `None` if it does not exist.
    pub fn delete(&self, id: TaskId) -> Option<TaskMutation> {
        let mut tasks = self.tasks.write();
        let index = tasks.iter().position(|t| t.id == id)?;
        let removed = tasks.remove(index);
        Some(TaskMutation::deleted(&removed))
    }

    /// Looks a task up by id.
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().iter().find(|t| t.id == id).cloned()
    }

    fn matching(&self, filter: &TaskFilter) -> Vec<Task> {
        self.tasks
            .read()
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }
}

fn next_update(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = previous + ChronoDuration::milliseconds(1);
    if now.timestamp_millis() > previous.timestamp_millis() {
        now
    } else {
        floor
    }
}

#[async_trait]
impl TaskSource for MemoryTaskSource {
    async fn count(&self, filter: &TaskFilter) -> ExportResult<u64> {
        Ok(self.matching(filter).len() as u64)
    }

    async fn freshness(&self, filter: &TaskFilter) -> ExportResult<Option<DateTime<Utc>>> {
        Ok(self.matching(filter).iter().map(|t| t.updated_at).max())
    }

    async fn fetch_batch(&self, filter: &TaskFilter, offset: u64, limit: usize) -> ExportResult<Vec<Task>> {
        if let Some(delay) = self.batch_delay {
            tokio::time::sleep(delay).await;
        }
        let mut rows = self.matching(filter);
        rows.sort_by(|a, b| filter.compare(a, b));
        Ok(rows
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit)
            .collect())
    }
}
