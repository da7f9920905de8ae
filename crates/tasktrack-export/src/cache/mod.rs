//! Two-tier export cache.
//!
//! The ephemeral tier holds short-lived metadata entries in the durable
//! store under `{prefix}:cache:{status}:{priority}:{digest}`. The durable
//! tier is the export history table. Keys fold in the data freshness of the
//! filter, so any write to a matching task produces a new key; selective
//! invalidation on task mutations only improves hit rate and reclaims
//! artifact files.

mod history;
mod service;
mod sqlite;

pub use self::history::{ExportHistoryRecord, ExportHistoryStore, HistoryPredicate, HistoryUpdate, MemoryExportHistory};
pub use self::service::{ExportCacheService, InvalidationReport};
pub use self::sqlite::SqliteExportHistory;

use crate::error::ExportError;
use crate::filter::{parse_facet, TaskFilter, ALL_FACET};
use crate::job::ExportFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tasktrack_core::TaskMutation;

/// Identity of a cacheable export.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// SHA-256 hex of normalized filter, format and freshness.
    pub digest: String,
    pub status_facet: String,
    pub priority_facet: String,
    /// Freshness timestamp the digest was computed with, in epoch ms.
    /// Zero when no task matches.
    pub freshness_ms: i64,
}

impl CacheKey {
    /// Computes the key for an export of `filter` in `format` over data last
    /// modified at `freshness`.
    pub fn compute(filter: &TaskFilter, format: ExportFormat, freshness: Option<DateTime<Utc>>) -> Self {
        let freshness_ms = freshness.map_or(0, |f| f.timestamp_millis());
        let mut hasher = Sha256::new();
        hasher.update(filter.normalized().to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(format.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(freshness_ms.to_string().as_bytes());

        Self {
            digest: hex::encode(hasher.finalize()),
            status_facet: filter.status_facet(),
            priority_facet: filter.priority_facet(),
            freshness_ms,
        }
    }
}

/// How long a cached export lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlClass {
    Standard,
    Extended,
}

impl TtlClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtlClass::Standard => "standard",
            TtlClass::Extended => "extended",
        }
    }
}

impl fmt::Display for TtlClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TtlClass {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(TtlClass::Standard),
            "extended" => Ok(TtlClass::Extended),
            other => Err(ExportError::Cache(format!("unknown ttl class '{}'", other))),
        }
    }
}

/// Ephemeral tier entry. Metadata only; the bytes live in the artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedExport {
    pub job_id: String,
    pub filename: String,
    pub artifact_path: PathBuf,
    pub total_records: u64,
    pub file_size_bytes: u64,
    pub ttl_class: TtlClass,
    /// Epoch ms.
    pub created_at: i64,
}

/// Facet values a task mutation touched.
///
/// An entry is in scope when, in both dimensions, its facet is `all` or
/// names one of the touched values. Filters on other fields (assignee,
/// search, due dates) are not narrowed further; freshness in the key covers
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InvalidationScope {
    pub statuses: Vec<String>,
    pub priorities: Vec<String>,
}

impl InvalidationScope {
    pub fn for_mutation(mutation: &TaskMutation) -> Self {
        Self {
            statuses: mutation.statuses().iter().map(|s| s.as_str().to_string()).collect(),
            priorities: mutation.priorities().iter().map(|p| p.as_str().to_string()).collect(),
        }
    }

    /// Returns true if an entry with these facets could contain the task.
    pub fn covers(&self, status_facet: &str, priority_facet: &str) -> bool {
        facet_hits(status_facet, &self.statuses) && facet_hits(priority_facet, &self.priorities)
    }

    /// Status facets worth scanning for: every touched status plus `all`.
    pub fn status_candidates(&self) -> Vec<String> {
        let mut out = self.statuses.clone();
        out.push(ALL_FACET.to_string());
        out
    }
}

fn facet_hits(facet: &str, touched: &[String]) -> bool {
    match parse_facet(facet) {
        None => true,
        Some(names) => names.iter().any(|n| touched.iter().any(|t| t == n)),
    }
}
