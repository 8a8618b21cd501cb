use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// One entry read from an append-only stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Fixed capability set the system needs from its cache cluster.
///
/// Kept deliberately narrow: strings with TTLs, atomic counters, hashes for
/// spill buffers, and consumer-group streams for the click fallback. Every
/// path in the data plane goes through this trait, so tests can swap in
/// [`crate::cache::MemoryBackend`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Set-if-absent with TTL; returns whether the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Compare-and-delete: remove `key` only while it still holds `token`.
    /// Returns whether a deletion happened.
    async fn del_if_equals(&self, key: &str, token: &str) -> Result<bool>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    async fn xadd(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String>;

    /// Create a consumer group at stream start, creating the stream if
    /// missing. Idempotent: an existing group is not an error.
    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<()>;

    /// Read new entries for `consumer` in `group`, blocking up to `block`.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    /// Number of live keys; drives the warmer's `target_keys` option.
    async fn dbsize(&self) -> Result<i64>;

    /// Keys matching a glob pattern. Used off the request path only (the
    /// warmer's buffer-activity scan).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    fn name(&self) -> &'static str;
}
