//! Store key layout.

/// Builds every key the export subsystem writes.
#[derive(Debug, Clone)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Pending queue (sorted set: job id by dispatch score).
    pub fn pending_queue(&self) -> String {
        format!("{}:queue:pending", self.prefix)
    }

    /// Job record (hash).
    pub fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.job_prefix(), job_id)
    }

    /// Prefix shared by every job record key.
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    /// Scan pattern for every job record.
    pub fn job_pattern(&self) -> String {
        format!("{}*", self.job_prefix())
    }

    /// Ephemeral cache entry (TTL string).
    pub fn cache(&self, status_facet: &str, priority_facet: &str, digest: &str) -> String {
        format!("{}:cache:{}:{}:{}", self.prefix, status_facet, priority_facet, digest)
    }

    /// Scan pattern for cache entries whose status facet mentions `status`.
    pub fn cache_status_pattern(&self, status: &str) -> String {
        format!("{}:cache:*{}*:*", self.prefix, status)
    }

    /// Splits a cache key into `(status_facet, priority_facet, digest)`.
    pub fn parse_cache(&self, key: &str) -> Option<(String, String, String)> {
        let rest = key.strip_prefix(&format!("{}:cache:", self.prefix))?;
        let mut parts = rest.splitn(3, ':');
        let status = parts.next()?;
        let priority = parts.next()?;
        let digest = parts.next()?;
        if status.is_empty() || priority.is_empty() || digest.is_empty() {
            return None;
        }
        Some((status.to_string(), priority.to_string(), digest.to_string()))
    }
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self::new("tasktrack:export")
    }
}
