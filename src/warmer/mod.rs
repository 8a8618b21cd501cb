//! Background cache warmer.
//!
//! Each tick repopulates the lookup cache with a blend of the most-clicked
//! records, the newest records, and codes with high click-buffer activity
//! (hot content whose clicks have not been flushed into the persisted
//! ordering yet), so hot entries survive TTL expiry and flush
//! invalidation. Optional extensions allocate ID ranges ahead of demand,
//! broaden coverage with random records, top the cache up to a target key
//! count, and react to a sagging hit rate.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::allocator::{IdAllocator, MAX_BLOCK};
use crate::cache::lookup::url_key;
use crate::cache::{CacheBackend, CachePair};
use crate::clicks::buffer_key;
use crate::config::WarmerConfig;
use crate::models::UrlRecord;
use crate::storage::UrlStore;

const FAILURE_BACKOFF: Duration = Duration::from_secs(2);

/// Records probed when estimating the cache hit rate.
const HIT_RATE_SAMPLE: i64 = 100;

/// Batch warmed per iteration while chasing `target_keys`.
const TARGET_KEYS_BATCH: i64 = 500;
const TARGET_KEYS_MAX_ROUNDS: usize = 10;

pub struct CacheWarmer {
    store: Arc<dyn UrlStore>,
    cache: CachePair,
    allocator: Option<Arc<IdAllocator>>,
    config: WarmerConfig,
    ttl: Duration,
}

impl CacheWarmer {
    pub fn new(
        store: Arc<dyn UrlStore>,
        cache: CachePair,
        allocator: Option<Arc<IdAllocator>>,
        config: WarmerConfig,
        url_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            cache,
            allocator,
            config,
            ttl: Duration::from_secs(url_ttl_secs),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval_secs,
            top_n = self.config.top_n,
            "cache warmer started"
        );
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("cache warmer stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(warmed) => debug!(warmed, "cache warm cycle complete"),
                        Err(err) => {
                            error!(error = %err, "cache warm cycle failed");
                            tokio::time::sleep(FAILURE_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    /// One warm cycle; returns the number of entries written.
    pub async fn tick(&self) -> Result<usize> {
        let newest_count =
            (self.config.top_n as f64 * self.config.newest_share.clamp(0.0, 1.0)) as i64;
        let buffer_count =
            (self.config.top_n as f64 * self.config.buffer_share.clamp(0.0, 1.0)) as i64;
        let popular_count = (self.config.top_n - newest_count - buffer_count).max(0);

        let mut records = self.store.top_clicked(popular_count).await?;
        merge_unique(&mut records, self.store.newest(newest_count).await?);
        merge_unique(&mut records, self.high_buffer_records(buffer_count).await?);
        if self.config.random_sample > 0 {
            merge_unique(
                &mut records,
                self.store.random_sample(self.config.random_sample).await?,
            );
        }

        let mut warmed = self.write_all(&records).await?;

        if self.config.pregenerate > 0 {
            self.pregenerate(self.config.pregenerate).await;
        }
        if self.config.target_keys > 0 {
            warmed += self.fill_to_target(self.config.target_keys).await?;
        }
        if self.config.hit_rate_threshold > 0.0 {
            let rate = self.sample_hit_rate().await?;
            if rate < self.config.hit_rate_threshold {
                debug!(rate, "hit rate below threshold, running extra warm cycle");
                let extra = self.store.top_clicked(self.config.top_n).await?;
                warmed += self.write_all(&extra).await?;
            }
        }

        Ok(warmed)
    }

    /// Records whose codes have the most clicks sitting in the buffer:
    /// real-time hot content that may not have reached the persisted
    /// top-N yet. Buffered deltas order the selection only; the warmed
    /// payload is the authoritative store record, so statistics reads do
    /// not count the buffer twice.
    async fn high_buffer_records(&self, limit: i64) -> Result<Vec<UrlRecord>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let prefix = buffer_key("");
        let keys = self
            .cache
            .writer
            .scan_keys(&format!("{prefix}*"))
            .await?;

        let mut activity = Vec::new();
        for key in keys {
            let Some(code) = key.strip_prefix(&prefix) else {
                continue;
            };
            match self.cache.writer.get(&key).await {
                Ok(Some(raw)) => {
                    let buffered = raw.parse::<i64>().unwrap_or(0);
                    if buffered > 0 {
                        activity.push((code.to_string(), buffered));
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to read click buffer during warm");
                }
            }
        }

        activity.sort_by(|a, b| b.1.cmp(&a.1));
        activity.truncate(limit as usize);

        let mut records = Vec::with_capacity(activity.len());
        for (code, _) in activity {
            if let Some(record) = self.store.get(&code).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn write_all(&self, records: &[UrlRecord]) -> Result<usize> {
        for record in records {
            let payload = serde_json::to_string(record)?;
            self.cache
                .writer
                .set_ex(&url_key(&record.short_code), &payload, self.ttl)
                .await?;
        }
        Ok(records.len())
    }

    /// Prime allocator blocks ahead of demand. Pre-generated ranges are not
    /// inserted as resolvable records.
    async fn pregenerate(&self, count: i64) {
        let Some(allocator) = &self.allocator else {
            warn!("pregenerate configured but no allocator wired");
            return;
        };
        let mut remaining = count;
        while remaining > 0 {
            let size = remaining.min(MAX_BLOCK);
            match allocator.allocate_range(size).await {
                Ok(range) => {
                    debug!(start = range.start, end = range.end, "pre-allocated id range");
                    remaining -= size;
                }
                Err(err) => {
                    warn!(error = %err, "pre-generation allocation failed");
                    return;
                }
            }
        }
    }

    /// Warm random records until the cache holds at least `target` keys.
    async fn fill_to_target(&self, target: i64) -> Result<usize> {
        let mut warmed = 0;
        for _ in 0..TARGET_KEYS_MAX_ROUNDS {
            let live = self.cache.writer.dbsize().await?;
            if live >= target {
                break;
            }
            let batch = self.store.random_sample(TARGET_KEYS_BATCH).await?;
            if batch.is_empty() {
                break;
            }
            warmed += self.write_all(&batch).await?;
        }
        Ok(warmed)
    }

    /// Estimate the hit rate (percent) by probing random records' cache
    /// entries through the reader.
    async fn sample_hit_rate(&self) -> Result<f64> {
        let sample = self.store.random_sample(HIT_RATE_SAMPLE).await?;
        if sample.is_empty() {
            return Ok(100.0);
        }
        let mut present = 0usize;
        for record in &sample {
            if self
                .cache
                .reader
                .get(&url_key(&record.short_code))
                .await?
                .is_some()
            {
                present += 1;
            }
        }
        Ok(present as f64 / sample.len() as f64 * 100.0)
    }
}

fn merge_unique(records: &mut Vec<UrlRecord>, extra: Vec<UrlRecord>) {
    for record in extra {
        if !records.iter().any(|r| r.short_code == record.short_code) {
            records.push(record);
        }
    }
}
