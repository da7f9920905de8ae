//! Read access to the tasks being exported.

mod memory;
mod sqlite;

pub use self::memory::MemoryTaskSource;
pub use self::sqlite::SqliteTaskSource;

use crate::error::ExportResult;
use crate::filter::TaskFilter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tasktrack_core::Task;

/// Query side of the task store.
///
/// `fetch_batch` must return rows in the filter's total order (sort field,
/// then task id) so consecutive offsets never skip or repeat a task.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Number of tasks matching the filter.
    async fn count(&self, filter: &TaskFilter) -> ExportResult<u64>;

    /// Latest `updated_at` among matching tasks. `None` when nothing matches.
    async fn freshness(&self, filter: &TaskFilter) -> ExportResult<Option<DateTime<Utc>>>;

    /// One page of matching tasks starting at `offset`.
    async fn fetch_batch(&self, filter: &TaskFilter, offset: u64, limit: usize) -> ExportResult<Vec<Task>>;
}
