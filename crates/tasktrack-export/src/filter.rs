//! Export filters.
//!
//! A [`TaskFilter`] selects which tasks an export contains and in what order.
//! Its normalized form is part of the cache key, so two filters that select
//! the same rows in the same order normalize identically.

use crate::error::{ExportError, ExportResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tasktrack_core::{Task, TaskPriority, TaskStatus};

/// Longest accepted search term.
pub const MAX_SEARCH_LEN: usize = 200;

/// Facet name used when a dimension is unconstrained.
pub const ALL_FACET: &str = "all";

/// Field an export is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    DueDate,
    Priority,
    Title,
}

impl SortField {
    /// Returns the wire name of this field.
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "createdAt",
            SortField::UpdatedAt => "updatedAt",
            SortField::DueDate => "dueDate",
            SortField::Priority => "priority",
            SortField::Title => "title",
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Ordering of exported rows. Ties are always broken by task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortSpec {
    #[serde(default)]
    pub field: SortField,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Which tasks an export contains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Vec<TaskStatus>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Vec<TaskPriority>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_after: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_before: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
}

impl TaskFilter {
    /// Rejects filters that cannot be executed.
    pub fn validate(&self) -> ExportResult<()> {
        if let (Some(after), Some(before)) = (self.due_after, self.due_before) {
            if after > before {
                return Err(ExportError::validation(format!(
                    "dueAfter ({}) is later than dueBefore ({})",
                    after, before
                )));
            }
        }

        if let Some(search) = &self.search {
            let trimmed = search.trim();
            if trimmed.is_empty() {
                return Err(ExportError::validation("search term must not be empty"));
            }
            if trimmed.chars().count() > MAX_SEARCH_LEN {
                return Err(ExportError::validation(format!(
                    "search term exceeds {} characters",
                    MAX_SEARCH_LEN
                )));
            }
        }

        if let Some(assignee) = &self.assignee {
            if assignee.trim().is_empty() {
                return Err(ExportError::validation("assignee must not be empty"));
            }
        }

        Ok(())
    }

    /// Status constraint, sorted and deduplicated. `None` when unconstrained.
    pub fn statuses(&self) -> Option<Vec<TaskStatus>> {
        self.status.as_ref().filter(|v| !v.is_empty()).map(|v| {
            let mut v = v.clone();
            v.sort();
            v.dedup();
            v
        })
    }

    /// Priority constraint, sorted and deduplicated. `None` when unconstrained.
    pub fn priorities(&self) -> Option<Vec<TaskPriority>> {
        self.priority.as_ref().filter(|v| !v.is_empty()).map(|v| {
            let mut v = v.clone();
            v.sort();
            v.dedup();
            v
        })
    }

    /// Trimmed search term, if any.
    pub fn search_term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Trimmed assignee, if any.
    pub fn assignee_name(&self) -> Option<&str> {
        self.assignee.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Effective sort order.
    pub fn sort_spec(&self) -> SortSpec {
        self.sort.unwrap_or_default()
    }

    /// Canonical JSON form: nulls and empty lists pruned, lists sorted,
    /// object keys sorted, the default sort omitted.
    pub fn normalized(&self) -> Value {
        let mut map = Map::new();

        if let Some(statuses) = self.statuses() {
            let names: Vec<&str> = statuses.iter().map(TaskStatus::as_str).collect();
            map.insert("status".into(), Value::from(names));
        }
        if let Some(priorities) = self.priorities() {
            let names: Vec<&str> = priorities.iter().map(TaskPriority::as_str).collect();
            map.insert("priority".into(), Value::from(names));
        }
        if let Some(assignee) = self.assignee_name() {
            map.insert("assignee".into(), Value::from(assignee));
        }
        if let Some(search) = self.search_term() {
            map.insert("search".into(), Value::from(search));
        }
        if let Some(after) = self.due_after {
            map.insert("dueAfter".into(), Value::from(after.timestamp_millis()));
        }
        if let Some(before) = self.due_before {
            map.insert("dueBefore".into(), Value::from(before.timestamp_millis()));
        }
        let sort = self.sort_spec();
        if sort != SortSpec::default() {
            let mut sort_map = Map::new();
            sort_map.insert("field".into(), Value::from(sort.field.as_str()));
            let direction = match sort.direction {
                SortDirection::Asc => "asc",
                SortDirection::Desc => "desc",
            };
            sort_map.insert("direction".into(), Value::from(direction));
            map.insert("sort".into(), Value::Object(sort_map));
        }

        Value::Object(map)
    }

    /// Storage facet for the status dimension, e.g. `todo+done` or `all`.
    pub fn status_facet(&self) -> String {
        match self.statuses() {
            Some(v) => join_facet(v.iter().map(TaskStatus::as_str)),
            None => ALL_FACET.to_string(),
        }
    }

    /// Storage facet for the priority dimension, e.g. `high` or `all`.
    pub fn priority_facet(&self) -> String {
        match self.priorities() {
            Some(v) => join_facet(v.iter().map(TaskPriority::as_str)),
            None => ALL_FACET.to_string(),
        }
    }

    /// Returns true if the task is selected by this filter.
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = self.statuses() {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(priorities) = self.priorities() {
            if !priorities.contains(&task.priority) {
                return false;
            }
        }
        if let Some(assignee) = self.assignee_name() {
            if task.assignee.as_deref() != Some(assignee) {
                return false;
            }
        }
        if let Some(term) = self.search_term() {
            let term = term.to_lowercase();
            let in_title = task.title.to_lowercase().contains(&term);
            let in_description = task
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&term));
            if !in_title && !in_description {
                return false;
            }
        }
        if self.due_after.is_some() || self.due_before.is_some() {
            let Some(due) = task.due_date else {
                return false;
            };
            if self.due_after.is_some_and(|after| due < after) {
                return false;
            }
            if self.due_before.is_some_and(|before| due > before) {
                return false;
            }
        }
        true
    }

    /// Total export order for two tasks.
    pub fn compare(&self, a: &Task, b: &Task) -> Ordering {
        let sort = self.sort_spec();
        let primary = match sort.field {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::DueDate => a.due_date.cmp(&b.due_date),
            SortField::Priority => a.priority.rank().cmp(&b.priority.rank()),
            SortField::Title => a.title.cmp(&b.title),
        };
        let primary = match sort.direction {
            SortDirection::Asc => primary,
            SortDirection::Desc => primary.reverse(),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

fn join_facet<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join("+")
}

/// Splits a storage facet back into its names. `all` yields `None`.
pub fn parse_facet(facet: &str) -> Option<Vec<&str>> {
    if facet == ALL_FACET {
        None
    } else {
        Some(facet.split('+').collect())
    }
}
