use super::TaskSource;
use crate::error::{ExportError, ExportResult};
use crate::filter::{SortDirection, SortField, TaskFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tasktrack_core::{Task, TaskId, TaskMutation};
use tracing::debug;

const SELECT_COLUMNS: &str = "SELECT id, title, description, status, priority, assignee, \
     due_date, created_at, updated_at FROM tasks";

const PRIORITY_RANK: &str = "CASE priority WHEN 'low' THEN 0 WHEN 'medium' THEN 1 ELSE 2 END";

/// Task source backed by the `tasks` table.
#[derive(Debug, Clone)]
pub struct SqliteTaskSource {
    pool: SqlitePool,
}

impl SqliteTaskSource {
    /// Creates a source over an existing pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a task. Returns the matching mutation.
    pub async fn upsert(&self, task: &Task) -> ExportResult<TaskMutation> {
        let previous = self.find(task.id).await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, title, description, status, priority, assignee,
                               due_date, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                status = excluded.status,
                priority = excluded.priority,
                assignee = excluded.assignee,
                due_date = excluded.due_date,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(&task.assignee)
        .bind(task.due_date.map(|d| d.timestamp_millis()))
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(match previous {
            Some(before) => TaskMutation::updated(&before, task),
            None => TaskMutation::created(task),
        })
    }

    /// Deletes a task. Returns `None` if it did not exist.
    pub async fn delete(&self, id: TaskId) -> ExportResult<Option<TaskMutation>> {
        let Some(task) = self.find(id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(Some(TaskMutation::deleted(&task)))
    }

    /// Looks a task up by id.
    pub async fn find(&self, id: TaskId) -> ExportResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }
}

/// Database row representation of a task. Timestamps are epoch milliseconds.
#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    title: String,
    description: Option<String>,
    status: String,
    priority: String,
    assignee: Option<String>,
    due_date: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = ExportError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let key = format!("tasks/{}", row.id);
        let id = TaskId::parse(&row.id).map_err(|e| ExportError::malformed(&key, e.to_string()))?;
        let status = row.status.parse().map_err(|e: String| ExportError::malformed(&key, e))?;
        let priority = row.priority.parse().map_err(|e: String| ExportError::malformed(&key, e))?;
        let millis = |ms: i64| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| ExportError::malformed(&key, format!("timestamp out of range: {}", ms)))
        };

        Ok(Task {
            id,
            title: row.title,
            description: row.description,
            status,
            priority,
            assignee: row.assignee,
            due_date: row.due_date.map(millis).transpose()?,
            created_at: millis(row.created_at)?,
            updated_at: millis(row.updated_at)?,
        })
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &TaskFilter) {
    qb.push(" WHERE 1 = 1");

    if let Some(statuses) = filter.statuses() {
        qb.push(" AND status IN (");
        let mut list = qb.separated(", ");
        for status in statuses {
            list.push_bind(status.as_str());
        }
        list.push_unseparated(")");
    }
    if let Some(priorities) = filter.priorities() {
        qb.push(" AND priority IN (");
        let mut list = qb.separated(", ");
        for priority in priorities {
            list.push_bind(priority.as_str());
        }
        list.push_unseparated(")");
    }
    if let Some(assignee) = filter.assignee_name() {
        qb.push(" AND assignee = ").push_bind(assignee.to_string());
    }
    if let Some(term) = filter.search_term() {
        let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
        qb.push(" AND (LOWER(title) LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR LOWER(COALESCE(description, '')) LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
    if let Some(after) = filter.due_after {
        qb.push(" AND due_date IS NOT NULL AND due_date >= ")
            .push_bind(after.timestamp_millis());
    }
    if let Some(before) = filter.due_before {
        qb.push(" AND due_date IS NOT NULL AND due_date <= ")
            .push_bind(before.timestamp_millis());
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Sqlite>, filter: &TaskFilter) {
    let sort = filter.sort_spec();
    let column = match sort.field {
        SortField::CreatedAt => "created_at",
        SortField::UpdatedAt => "updated_at",
        SortField::DueDate => "due_date",
        SortField::Priority => PRIORITY_RANK,
        SortField::Title => "title",
    };
    let direction = match sort.direction {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
    };
    qb.push(format!(" ORDER BY {} {}, id ASC", column, direction));
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl TaskSource for SqliteTaskSource {
    async fn count(&self, filter: &TaskFilter) -> ExportResult<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM tasks");
        push_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn freshness(&self, filter: &TaskFilter) -> ExportResult<Option<DateTime<Utc>>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT MAX(updated_at) FROM tasks");
        push_filter(&mut qb, filter);
        let latest: Option<i64> = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(latest.and_then(DateTime::from_timestamp_millis))
    }

    async fn fetch_batch(&self, filter: &TaskFilter, offset: u64, limit: usize) -> ExportResult<Vec<Task>> {
        debug!(offset, limit, "Fetching task batch");

        let mut qb = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        push_filter(&mut qb, filter);
        push_order(&mut qb, filter);
        qb.push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Task::try_from).collect()
    }
}
