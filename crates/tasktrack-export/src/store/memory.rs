//! Process-local durable store.
//!
//! Implements the same contract as the Redis store under a single mutex,
//! which makes the compound operations trivially atomic. Used for
//! single-node deployments without Redis and throughout the tests.

use super::{glob_match, DurableStore, GuardedWrite, QueueOp};
use crate::error::ExportResult;
use crate::job::{fields, JobStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f64);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, Score>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), Score(score)) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn pop_min(&mut self) -> Option<String> {
        let (_, member) = self.ordered.pop_first()?;
        self.scores.remove(&member);
        Some(member)
    }
}

/// Open scan cursors kept at once. Evicted cursors restart from the top.
const MAX_OPEN_CURSORS: usize = 1024;

#[derive(Debug, Default)]
struct Inner {
    zsets: HashMap<String, SortedSet>,
    hashes: HashMap<String, HashMap<String, String>>,
    strings: HashMap<String, (String, Instant)>,
    /// Scan cursor id → last key the previous page walked.
    cursors: BTreeMap<u64, String>,
    last_cursor: u64,
}

impl Inner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings.retain(|_, (_, expires)| *expires > now);
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .zsets
            .iter()
            .filter(|(_, set)| !set.scores.is_empty())
            .map(|(k, _)| k.clone())
            .chain(self.hashes.keys().cloned())
            .chain(self.strings.keys().cloned())
            .collect();
        keys.sort();
        keys
    }
}

/// In-memory [`DurableStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys of any type.
    pub fn key_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.keys().len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> ExportResult<()> {
        self.inner
            .lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> ExportResult<bool> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> ExportResult<Vec<(String, f64)>> {
        let inner = self.inner.lock();
        let Some(set) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .ordered
            .iter()
            .filter(|(score, _)| score.0 >= min && score.0 <= max)
            .take(limit)
            .map(|(score, member)| (member.clone(), score.0))
            .collect())
    }

    async fn zcard(&self, key: &str) -> ExportResult<u64> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get(key)
            .map_or(0, |set| set.scores.len() as u64))
    }

    async fn hget(&self, key: &str, field: &str) -> ExportResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hget_all(&self, key: &str) -> ExportResult<HashMap<String, String>> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hset_fields(&self, key: &str, fields: &[(String, String)]) -> ExportResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (name, value) in fields {
            hash.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> ExportResult<Option<String>> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner.strings.get(key).map(|(v, _)| v.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ExportResult<()> {
        self.inner
            .lock()
            .strings
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> ExportResult<bool> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        let zset = inner.zsets.remove(key).is_some_and(|s| !s.scores.is_empty());
        let hash = inner.hashes.remove(key).is_some();
        let string = inner.strings.remove(key).is_some();
        Ok(zset || hash || string)
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> ExportResult<(u64, Vec<String>)> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        let keys = inner.keys();

        // Resume strictly after the last walked key, so deletions between
        // pages never shift a live key out of view.
        let start = match inner.cursors.remove(&cursor) {
            Some(after) => keys.partition_point(|k| *k <= after),
            None => 0,
        };
        let end = (start + count.max(1)).min(keys.len());
        let page = keys.get(start..end).unwrap_or_default();
        let batch = page.iter().filter(|k| glob_match(pattern, k)).cloned().collect();

        let next = match page.last() {
            Some(last) if end < keys.len() => {
                inner.last_cursor = inner.last_cursor.checked_add(1).unwrap_or(1);
                let id = inner.last_cursor;
                inner.cursors.insert(id, last.clone());
                while inner.cursors.len() > MAX_OPEN_CURSORS {
                    inner.cursors.pop_first();
                }
                id
            }
            _ => 0,
        };
        Ok((next, batch))
    }

    async fn claim_next(&self, queue_key: &str, job_key_prefix: &str, now_ms: i64) -> ExportResult<Option<String>> {
        let mut inner = self.inner.lock();
        let Inner { zsets, hashes, .. } = &mut *inner;
        let Some(queue) = zsets.get_mut(queue_key) else {
            return Ok(None);
        };

        while let Some(id) = queue.pop_min() {
            let Some(record) = hashes.get_mut(&format!("{}{}", job_key_prefix, id)) else {
                continue;
            };
            if record.get(fields::STATUS).map(String::as_str) != Some(JobStatus::Pending.as_str()) {
                continue;
            }
            let now = now_ms.to_string();
            record.insert(fields::STATUS.into(), JobStatus::Processing.as_str().into());
            record.insert(fields::STARTED_AT.into(), now.clone());
            record.insert(fields::UPDATED_AT.into(), now);
            let attempts = record
                .get(fields::ATTEMPTS)
                .and_then(|a| a.parse::<u64>().ok())
                .unwrap_or(0);
            record.insert(fields::ATTEMPTS.into(), (attempts + 1).to_string());
            return Ok(Some(id));
        }
        Ok(None)
    }

    async fn guarded_write(&self, write: &GuardedWrite) -> ExportResult<bool> {
        let mut inner = self.inner.lock();

        let status = inner
            .hashes
            .get(&write.key)
            .and_then(|h| h.get(fields::STATUS))
            .map(String::as_str);
        if !write.admits(status) {
            return Ok(false);
        }

        if !write.fields.is_empty() {
            let hash = inner.hashes.entry(write.key.clone()).or_default();
            for (name, value) in &write.fields {
                hash.insert(name.clone(), value.clone());
            }
        }

        match &write.queue_op {
            QueueOp::None => {}
            QueueOp::Add { key, member, score } => {
                inner.zsets.entry(key.clone()).or_default().insert(member, *score);
            }
            QueueOp::Remove { key, member } => {
                if let Some(set) = inner.zsets.get_mut(key) {
                    set.remove(member);
                }
            }
        }
        Ok(true)
    }

    async fn ping(&self) -> ExportResult<()> {
        Ok(())
    }
}
