//! Redis-backed durable store.

use super::{DurableStore, GuardedWrite, QueueOp};
use crate::error::{ExportError, ExportResult};
use crate::job::{fields, JobStatus};
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use std::collections::HashMap;
use std::time::Duration;
use tasktrack_config::StoreConfig;
use tracing::{debug, info};

/// Pops pending ids until one still has a pending record, then claims it.
const CLAIM_NEXT_SCRIPT: &str = r#"
local queue = KEYS[1]
local prefix = ARGV[1]
local now = ARGV[2]
while true do
  local popped = redis.call('ZPOPMIN', queue, 1)
  if #popped == 0 then
    return false
  end
  local id = popped[1]
  local key = prefix .. id
  if redis.call('HGET', key, ARGV[3]) == ARGV[4] then
    redis.call('HSET', key, ARGV[3], ARGV[5], ARGV[6], now, ARGV[7], now)
    redis.call('HINCRBY', key, ARGV[8], 1)
    return id
  end
end
"#;

/// Compare-and-set on the status field, then fields plus queue op.
///
/// ARGV: status field, comma-separated expected statuses (empty = any),
/// queue op (`add`/`remove`/`none`), member, score, then field/value pairs.
const GUARDED_WRITE_SCRIPT: &str = r#"
local expected = ARGV[2]
if expected ~= '' then
  local status = redis.call('HGET', KEYS[1], ARGV[1])
  if not status then
    return 0
  end
  local admitted = false
  for s in string.gmatch(expected, '[^,]+') do
    if s == status then
      admitted = true
      break
    end
  end
  if not admitted then
    return 0
  end
end
if #ARGV > 5 then
  redis.call('HSET', KEYS[1], unpack(ARGV, 6))
end
if ARGV[3] == 'add' then
  redis.call('ZADD', KEYS[2], ARGV[5], ARGV[4])
elseif ARGV[3] == 'remove' then
  redis.call('ZREM', KEYS[2], ARGV[4])
end
return 1
"#;

/// Create a Redis connection pool.
pub async fn create_pool(config: &StoreConfig) -> ExportResult<Pool> {
    info!("Creating Redis connection pool for export store...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| ExportError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .wait_timeout(Some(config.connect_timeout()))
        .create_timeout(Some(config.connect_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| ExportError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    ::redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis-backed [`DurableStore`].
pub struct RedisStore {
    pool: Pool,
    claim_script: Script,
    write_script: Script,
}

impl RedisStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            claim_script: Script::new(CLAIM_NEXT_SCRIPT),
            write_script: Script::new(GUARDED_WRITE_SCRIPT),
        }
    }

    /// Connects using the store configuration.
    pub async fn connect(config: &StoreConfig) -> ExportResult<Self> {
        Ok(Self::new(create_pool(config).await?))
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> ExportResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> ExportResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> ExportResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> ExportResult<Vec<(String, f64)>> {
        let mut conn = self.conn().await?;
        let members: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(key, min, max, 0, limit as isize)
            .await?;
        Ok(members)
    }

    async fn zcard(&self, key: &str) -> ExportResult<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn hget(&self, key: &str, field: &str) -> ExportResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hget_all(&self, key: &str) -> ExportResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }

    async fn hset_fields(&self, key: &str, fields: &[(String, String)]) -> ExportResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> ExportResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ExportResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> ExportResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> ExportResult<(u64, Vec<String>)> {
        let mut conn = self.conn().await?;
        let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut *conn)
            .await?;
        Ok((next, keys))
    }

    async fn claim_next(&self, queue_key: &str, job_key_prefix: &str, now_ms: i64) -> ExportResult<Option<String>> {
        let mut conn = self.conn().await?;
        let claimed: Option<String> = self
            .claim_script
            .key(queue_key)
            .arg(job_key_prefix)
            .arg(now_ms)
            .arg(fields::STATUS)
            .arg(JobStatus::Pending.as_str())
            .arg(JobStatus::Processing.as_str())
            .arg(fields::STARTED_AT)
            .arg(fields::UPDATED_AT)
            .arg(fields::ATTEMPTS)
            .invoke_async(&mut *conn)
            .await?;

        if let Some(id) = &claimed {
            debug!(job_id = %id, "Claimed job");
        }
        Ok(claimed)
    }

    async fn guarded_write(&self, write: &GuardedWrite) -> ExportResult<bool> {
        let expected = write
            .expect_status
            .iter()
            .map(JobStatus::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let (op, zset, member, score) = match &write.queue_op {
            QueueOp::None => ("none", "", "", 0.0),
            QueueOp::Add { key, member, score } => ("add", key.as_str(), member.as_str(), *score),
            QueueOp::Remove { key, member } => ("remove", key.as_str(), member.as_str(), 0.0),
        };

        let mut invocation = self.write_script.prepare_invoke();
        invocation
            .key(&write.key)
            .key(zset)
            .arg(fields::STATUS)
            .arg(expected)
            .arg(op)
            .arg(member)
            .arg(score);
        for (name, value) in &write.fields {
            invocation.arg(name).arg(value);
        }

        let mut conn = self.conn().await?;
        let applied: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(applied == 1)
    }

    async fn ping(&self) -> ExportResult<()> {
        let mut conn = self.conn().await?;
        let _: String = ::redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}
