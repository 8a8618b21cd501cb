//! Distributed monotonic ID-range allocation.
//!
//! A logically single counter lives in the primary cache backend and is
//! advanced only under `id_allocation_lock`, so successful grants are
//! strictly disjoint across every instance. When the primary is unreachable
//! the allocator falls back to a secondary counter backend and finally to
//! the OLTP sequence; both keep the disjointness guarantee. Grants are
//! audited best-effort into a cache hash and, through a bounded in-process
//! deque, into the `id_allocation_records` table.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::cache::{CacheBackend, DistributedLock};
use crate::config::AllocatorConfig;
use crate::error::{ZipError, ZipResult};
use crate::storage::UrlStore;

pub const GLOBAL_COUNTER_KEY: &str = "global_id_counter";
pub const ALLOCATION_LOCK_KEY: &str = "id_allocation_lock";
pub const AUDIT_MAP_KEY: &str = "id_allocation_records";

/// Upper bound on one range grant.
pub const MAX_BLOCK: i64 = 10_000;

/// Audit deque capacity; overflow sheds the oldest audit records, never IDs.
const PENDING_CAPACITY: usize = 1000;

/// Width of the allocation-rate sample window.
const RATE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSource {
    PrimaryCache,
    SecondaryCache,
    Oltp,
}

impl AllocationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationSource::PrimaryCache => "primary_cache",
            AllocationSource::SecondaryCache => "secondary_cache",
            AllocationSource::Oltp => "oltp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Failed,
}

impl ServiceHealth {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceHealth::Healthy,
            1 => ServiceHealth::Degraded,
            _ => ServiceHealth::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServiceHealth::Healthy => 0,
            ServiceHealth::Degraded => 1,
            ServiceHealth::Failed => 2,
        }
    }
}

/// One successful grant: the inclusive range `[start, end]`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AllocatedRange {
    pub start: i64,
    pub end: i64,
    pub source: AllocationSource,
}

#[derive(Debug, Clone)]
pub struct PendingAllocation {
    pub start_id: i64,
    pub end_id: i64,
    pub range_size: i64,
    pub allocated_at: DateTime<Utc>,
    pub source: AllocationSource,
}

#[derive(Default)]
struct Metrics {
    total: AtomicU64,
    primary: AtomicU64,
    secondary: AtomicU64,
    oltp: AtomicU64,
    failed: AtomicU64,
    shed_audit_records: AtomicU64,
    health: AtomicU8,
}

#[derive(Debug, Serialize)]
pub struct AllocatorMetricsSnapshot {
    pub total_allocations: u64,
    pub primary_allocations: u64,
    pub secondary_allocations: u64,
    pub oltp_allocations: u64,
    pub failed_allocations: u64,
    pub shed_audit_records: u64,
    pub pending_audit_records: usize,
    pub health: ServiceHealth,
}

pub struct IdAllocator {
    primary: Arc<dyn CacheBackend>,
    secondary: Option<Arc<dyn CacheBackend>>,
    store: Arc<dyn UrlStore>,
    config: AllocatorConfig,
    pending: Mutex<VecDeque<PendingAllocation>>,
    sample_window: Mutex<VecDeque<Instant>>,
    metrics: Metrics,
}

impl IdAllocator {
    pub fn new(
        primary: Arc<dyn CacheBackend>,
        secondary: Option<Arc<dyn CacheBackend>>,
        store: Arc<dyn UrlStore>,
        config: AllocatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            primary,
            secondary,
            store,
            config,
            pending: Mutex::new(VecDeque::new()),
            sample_window: Mutex::new(VecDeque::new()),
            metrics: Metrics::default(),
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Allocate a range of `size` IDs, disjoint from every other successful
    /// grant across the system's lifetime.
    pub async fn allocate_range(&self, size: i64) -> ZipResult<AllocatedRange> {
        if !(1..=MAX_BLOCK).contains(&size) {
            return Err(ZipError::InvalidArgument(format!(
                "range size must be in [1, {MAX_BLOCK}], got {size}"
            )));
        }

        self.note_allocation();

        match self.allocate_from_primary(size).await {
            Ok(Some(range)) => {
                self.record_success(range);
                return Ok(range);
            }
            Ok(None) => {
                // The primary is reachable but the lock stayed contended;
                // falling back would race the lock holder's counter write.
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                return Err(ZipError::TemporarilyUnavailable(
                    "id allocation lock contended".to_string(),
                ));
            }
            Err(err) => {
                warn!(error = %err, "primary allocator backend failed");
            }
        }

        if let Some(secondary) = &self.secondary {
            match self.allocate_from_counter(secondary, size).await {
                Ok(range) => {
                    self.record_success(range);
                    return Ok(range);
                }
                Err(err) => {
                    warn!(error = %err, "secondary allocator backend failed");
                }
            }
        }

        match self.store.next_id_range(size).await {
            Ok((start, end)) => {
                let range = AllocatedRange {
                    start,
                    end,
                    source: AllocationSource::Oltp,
                };
                self.record_success(range);
                Ok(range)
            }
            Err(err) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                self.set_health(ServiceHealth::Failed);
                Err(ZipError::Unavailable(format!(
                    "all allocator backends failed: {err}"
                )))
            }
        }
    }

    /// Lock-serialized read/advance of the global counter. `Ok(None)` means
    /// the lock stayed contended through all retries.
    async fn allocate_from_primary(&self, size: i64) -> anyhow::Result<Option<AllocatedRange>> {
        let lock = DistributedLock::acquire(
            &self.primary,
            ALLOCATION_LOCK_KEY,
            Duration::from_secs(self.config.lock_ttl_secs),
            self.config.lock_retries,
        )
        .await?;
        let Some(lock) = lock else {
            return Ok(None);
        };

        let allocated = self.advance_counter(size).await;

        if let Err(err) = lock.release().await {
            warn!(error = %err, "failed to release id allocation lock");
        }

        allocated.map(Some)
    }

    async fn advance_counter(&self, size: i64) -> anyhow::Result<AllocatedRange> {
        let current = match self.primary.get(GLOBAL_COUNTER_KEY).await? {
            Some(raw) => raw.parse::<i64>()?,
            None => self.restore_counter().await?,
        };

        let start = current + 1;
        let end = current + size;
        self.primary
            .set(GLOBAL_COUNTER_KEY, &end.to_string())
            .await?;

        Ok(AllocatedRange {
            start,
            end,
            source: AllocationSource::PrimaryCache,
        })
    }

    /// Seed the counter after a cache wipe: resume past the highest audited
    /// range end, or at the configured base when the table is empty.
    async fn restore_counter(&self) -> anyhow::Result<i64> {
        let restored = match self.store.max_allocated_end().await {
            Ok(Some(max_end)) => max_end.max(self.config.base),
            Ok(None) => self.config.base,
            Err(err) => {
                warn!(error = %err, "audit table unreadable, seeding counter at base");
                self.config.base
            }
        };
        self.primary
            .set(GLOBAL_COUNTER_KEY, &restored.to_string())
            .await?;
        info!(counter = restored, "restored global id counter");
        Ok(restored)
    }

    /// Lockless grant from a plain atomic counter on a standby backend.
    async fn allocate_from_counter(
        &self,
        cache: &Arc<dyn CacheBackend>,
        size: i64,
    ) -> anyhow::Result<AllocatedRange> {
        let end = cache.incr_by(GLOBAL_COUNTER_KEY, size).await?;
        let end = if end < self.config.base {
            // Unseeded counter: jump past the base. INCRBY keeps concurrent
            // seeders disjoint.
            cache.incr_by(GLOBAL_COUNTER_KEY, self.config.base).await?
        } else {
            end
        };
        Ok(AllocatedRange {
            start: end - size + 1,
            end,
            source: AllocationSource::SecondaryCache,
        })
    }

    fn record_success(&self, range: AllocatedRange) {
        self.metrics.total.fetch_add(1, Ordering::Relaxed);
        let (counter, health) = match range.source {
            AllocationSource::PrimaryCache => (&self.metrics.primary, ServiceHealth::Healthy),
            AllocationSource::SecondaryCache => (&self.metrics.secondary, ServiceHealth::Degraded),
            AllocationSource::Oltp => (&self.metrics.oltp, ServiceHealth::Degraded),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.set_health(health);

        let pending = PendingAllocation {
            start_id: range.start,
            end_id: range.end,
            range_size: range.end - range.start + 1,
            allocated_at: Utc::now(),
            source: range.source,
        };

        // Fast-persist into the in-cache audit map. Runs outside the
        // allocation lock; losing a record here loses metadata, not IDs.
        let primary = Arc::clone(&self.primary);
        let field = format!("{}-{}", pending.start_id, pending.end_id);
        let value = format!("{}:{}", pending.allocated_at.timestamp(), pending.range_size);
        tokio::spawn(async move {
            if let Err(err) = primary.hset(AUDIT_MAP_KEY, &field, &value).await {
                warn!(error = %err, "failed to fast-persist allocation record");
            }
        });

        self.push_pending(pending);
    }

    fn push_pending(&self, record: PendingAllocation) {
        let mut queue = self.pending.lock().expect("pending deque poisoned");
        if queue.len() >= PENDING_CAPACITY {
            queue.pop_front();
            self.metrics
                .shed_audit_records
                .fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(record);
    }

    fn note_allocation(&self) {
        let now = Instant::now();
        let mut window = self.sample_window.lock().expect("sample window poisoned");
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > RATE_WINDOW)
        {
            window.pop_front();
        }
        window.push_back(now);
    }

    /// Allocations per second over the sample window.
    pub fn allocation_rate(&self) -> f64 {
        let now = Instant::now();
        let window = self.sample_window.lock().expect("sample window poisoned");
        window
            .iter()
            .filter(|t| now.duration_since(**t) <= RATE_WINDOW)
            .count() as f64
            / RATE_WINDOW.as_secs_f64()
    }

    fn set_health(&self, health: ServiceHealth) {
        self.metrics.health.store(health.as_u8(), Ordering::Relaxed);
    }

    /// Last observed health; re-evaluated on every allocation attempt.
    pub fn health(&self) -> ServiceHealth {
        ServiceHealth::from_u8(self.metrics.health.load(Ordering::Relaxed))
    }

    /// Live health probe of both backends.
    pub async fn probe_health(&self) -> (ServiceHealth, ServiceHealth, ServiceHealth) {
        let cache_health = match self.primary.ping().await {
            Ok(()) => ServiceHealth::Healthy,
            Err(_) => ServiceHealth::Failed,
        };
        let store_health = match self.store.ping().await {
            Ok(()) => ServiceHealth::Healthy,
            Err(_) => ServiceHealth::Failed,
        };
        let overall = match (cache_health, store_health) {
            (ServiceHealth::Healthy, _) => ServiceHealth::Healthy,
            (_, ServiceHealth::Healthy) => ServiceHealth::Degraded,
            _ => ServiceHealth::Failed,
        };
        self.set_health(overall);
        (overall, cache_health, store_health)
    }

    pub fn metrics(&self) -> AllocatorMetricsSnapshot {
        AllocatorMetricsSnapshot {
            total_allocations: self.metrics.total.load(Ordering::Relaxed),
            primary_allocations: self.metrics.primary.load(Ordering::Relaxed),
            secondary_allocations: self.metrics.secondary.load(Ordering::Relaxed),
            oltp_allocations: self.metrics.oltp.load(Ordering::Relaxed),
            failed_allocations: self.metrics.failed.load(Ordering::Relaxed),
            shed_audit_records: self.metrics.shed_audit_records.load(Ordering::Relaxed),
            pending_audit_records: self.pending_len(),
            health: self.health(),
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending deque poisoned").len()
    }

    pub(crate) fn oldest_pending_age(&self) -> Option<Duration> {
        let queue = self.pending.lock().expect("pending deque poisoned");
        queue
            .front()
            .map(|p| (Utc::now() - p.allocated_at).to_std().unwrap_or_default())
    }

    pub(crate) fn drain_pending(&self, max: usize) -> Vec<PendingAllocation> {
        let mut queue = self.pending.lock().expect("pending deque poisoned");
        let take = queue.len().min(max);
        queue.drain(..take).collect()
    }

    /// Put a failed batch back at the front, bounded by remaining capacity.
    pub(crate) fn requeue_pending(&self, records: Vec<PendingAllocation>) {
        let mut queue = self.pending.lock().expect("pending deque poisoned");
        let room = PENDING_CAPACITY.saturating_sub(queue.len());
        let dropped = records.len().saturating_sub(room);
        if dropped > 0 {
            self.metrics
                .shed_audit_records
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        for record in records.into_iter().take(room).rev() {
            queue.push_front(record);
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn UrlStore> {
        &self.store
    }
}
