//! Durable store abstraction.
//!
//! Everything the queue and the ephemeral cache tier persist goes through
//! [`DurableStore`]: sorted sets for the pending queue, hashes for job
//! records, TTL strings for cache entries, and cursor scans. The two
//! compound operations, [`DurableStore::claim_next`] and
//! [`DurableStore::guarded_write`], are atomic against every other client
//! of the same store.

mod keys;
mod memory;
mod redis;

pub use self::keys::StoreKeys;
pub use self::memory::MemoryStore;
pub use self::redis::{create_pool, RedisStore};

use crate::error::ExportResult;
use crate::job::{FieldList, JobStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Keys returned per scan step by [`DurableStore::scan_all`].
pub const SCAN_BATCH: usize = 200;

/// Sorted-set change applied together with a guarded write.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOp {
    None,
    Add { key: String, member: String, score: f64 },
    Remove { key: String, member: String },
}

/// A compare-and-set write to one record.
///
/// Applies only if the record's `status` field is one of `expect_status`
/// (an empty list means unconditional). Fields and the queue operation are
/// applied together or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedWrite {
    pub key: String,
    pub expect_status: Vec<JobStatus>,
    pub fields: FieldList,
    pub queue_op: QueueOp,
}

impl GuardedWrite {
    /// Write that applies only when the current status is one of `expect`.
    pub fn expecting(key: impl Into<String>, expect: &[JobStatus]) -> Self {
        Self {
            key: key.into(),
            expect_status: expect.to_vec(),
            fields: Vec::new(),
            queue_op: QueueOp::None,
        }
    }

    /// Write that always applies.
    pub fn unconditional(key: impl Into<String>) -> Self {
        Self::expecting(key, &[])
    }

    /// Adds fields to write.
    pub fn fields(mut self, fields: FieldList) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Sets the accompanying queue operation.
    pub fn queue(mut self, op: QueueOp) -> Self {
        self.queue_op = op;
        self
    }

    /// Returns true if `status` satisfies the guard.
    pub fn admits(&self, status: Option<&str>) -> bool {
        if self.expect_status.is_empty() {
            return true;
        }
        status.is_some_and(|s| self.expect_status.iter().any(|e| e.as_str() == s))
    }
}

/// Shared key-value store backing the queue and the ephemeral cache tier.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Adds or rescores a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> ExportResult<()>;

    /// Removes a sorted-set member. Returns true if it was present.
    async fn zrem(&self, key: &str, member: &str) -> ExportResult<bool>;

    /// Members with `min <= score <= max`, lowest first, at most `limit`.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> ExportResult<Vec<(String, f64)>>;

    /// Number of members in a sorted set.
    async fn zcard(&self, key: &str) -> ExportResult<u64>;

    /// Reads one hash field.
    async fn hget(&self, key: &str, field: &str) -> ExportResult<Option<String>>;

    /// Reads a whole hash. Missing keys yield an empty map.
    async fn hget_all(&self, key: &str) -> ExportResult<HashMap<String, String>>;

    /// Writes hash fields.
    async fn hset_fields(&self, key: &str, fields: &[(String, String)]) -> ExportResult<()>;

    /// Reads a string value.
    async fn get(&self, key: &str) -> ExportResult<Option<String>>;

    /// Writes a string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ExportResult<()>;

    /// Deletes a key of any type. Returns true if it existed.
    async fn del(&self, key: &str) -> ExportResult<bool>;

    /// One non-blocking scan step. A returned cursor of 0 ends the scan.
    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> ExportResult<(u64, Vec<String>)>;

    /// Every key matching `pattern`, collected across scan steps.
    async fn scan_all(&self, pattern: &str) -> ExportResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, batch) = self.scan(pattern, cursor, SCAN_BATCH).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Atomically pops the lowest-scored id from `queue_key` whose record
    /// (`{job_key_prefix}{id}`) is still pending, marks it processing,
    /// stamps `startedAt`/`updatedAt` and increments `attempts`. Members
    /// whose record is gone or no longer pending are dropped.
    async fn claim_next(&self, queue_key: &str, job_key_prefix: &str, now_ms: i64) -> ExportResult<Option<String>>;

    /// Applies a compare-and-set write. Returns true if it applied.
    async fn guarded_write(&self, write: &GuardedWrite) -> ExportResult<bool>;

    /// Liveness check.
    async fn ping(&self) -> ExportResult<()>;
}

/// Redis-style glob match supporting `*` and `?`.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();
    let (mut pi, mut ci) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ci));
            pi += 1;
        } else if let Some((sp, sc)) = star {
            pi = sp + 1;
            ci = sc + 1;
            star = Some((sp, sc + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
