use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::UrlRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-constraint violation on `short_code`.
    #[error("short code already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Audit row for one allocator range grant. Best-effort metadata, not the
/// source of truth for IDs.
#[derive(Debug, Clone)]
pub struct AllocationRecord {
    pub start_id: i64,
    pub end_id: i64,
    pub range_size: i64,
    pub allocated_at: DateTime<Utc>,
    pub source: String,
}

#[async_trait]
pub trait UrlStore: Send + Sync {
    /// Create tables, indexes and the allocator sequence.
    async fn init(&self) -> Result<()>;

    /// Insert a new URL record. `id` is the allocator-assigned id; `None`
    /// lets the store auto-assign one (custom-code path).
    async fn insert(
        &self,
        id: Option<i64>,
        short_code: &str,
        original_url: &str,
    ) -> StoreResult<UrlRecord>;

    async fn get(&self, short_code: &str) -> Result<Option<UrlRecord>>;

    async fn exists(&self, short_code: &str) -> Result<bool>;

    /// Apply additive click deltas in a single transaction. Zero and
    /// negative deltas are skipped.
    async fn add_clicks(&self, deltas: &[(String, i64)]) -> Result<()>;

    async fn top_clicked(&self, limit: i64) -> Result<Vec<UrlRecord>>;

    async fn newest(&self, limit: i64) -> Result<Vec<UrlRecord>>;

    async fn random_sample(&self, limit: i64) -> Result<Vec<UrlRecord>>;

    /// Batched audit insert; duplicate ranges are ignored.
    async fn record_allocations(&self, records: &[AllocationRecord]) -> Result<()>;

    /// Highest audited range end, used to restore the cache counter.
    async fn max_allocated_end(&self) -> Result<Option<i64>>;

    /// Collision-free ID range from the store's own sequence. The sequence
    /// advances by a fixed increment, so ranges stay disjoint for every
    /// `size` up to that increment.
    async fn next_id_range(&self, size: i64) -> Result<(i64, i64)>;

    async fn ping(&self) -> Result<()>;
}

/// Delegating wrapper that counts `get` calls. Test support for asserting
/// single-flight behavior.
#[cfg(test)]
pub struct CountingStore {
    inner: std::sync::Arc<dyn UrlStore>,
    reads: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

#[cfg(test)]
impl CountingStore {
    pub fn new(
        inner: std::sync::Arc<dyn UrlStore>,
        reads: std::sync::Arc<std::sync::atomic::AtomicU64>,
    ) -> Self {
        Self { inner, reads }
    }
}

#[cfg(test)]
#[async_trait]
impl UrlStore for CountingStore {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn insert(
        &self,
        id: Option<i64>,
        short_code: &str,
        original_url: &str,
    ) -> StoreResult<UrlRecord> {
        self.inner.insert(id, short_code, original_url).await
    }

    async fn get(&self, short_code: &str) -> Result<Option<UrlRecord>> {
        self.reads
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.get(short_code).await
    }

    async fn exists(&self, short_code: &str) -> Result<bool> {
        self.inner.exists(short_code).await
    }

    async fn add_clicks(&self, deltas: &[(String, i64)]) -> Result<()> {
        self.inner.add_clicks(deltas).await
    }

    async fn top_clicked(&self, limit: i64) -> Result<Vec<UrlRecord>> {
        self.inner.top_clicked(limit).await
    }

    async fn newest(&self, limit: i64) -> Result<Vec<UrlRecord>> {
        self.inner.newest(limit).await
    }

    async fn random_sample(&self, limit: i64) -> Result<Vec<UrlRecord>> {
        self.inner.random_sample(limit).await
    }

    async fn record_allocations(&self, records: &[AllocationRecord]) -> Result<()> {
        self.inner.record_allocations(records).await
    }

    async fn max_allocated_end(&self) -> Result<Option<i64>> {
        self.inner.max_allocated_end().await
    }

    async fn next_id_range(&self, size: i64) -> Result<(i64, i64)> {
        self.inner.next_id_range(size).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}
