//! Stampede-protected lookup cache for `url:<code>` payloads.
//!
//! Reads go through the replica handle; on a miss at most one task per code
//! refills from the OLTP store under `lock:url:<code>`, while the rest
//! re-poll the reader and finally fall through to an unlocked store read.
//! Cache outages degrade to direct store reads and are never surfaced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::backend::CacheBackend;
use super::lock::DistributedLock;
use super::pair::CachePair;
use crate::config::CacheConfig;
use crate::error::{ZipError, ZipResult};
use crate::models::{CachedUrlPayload, UrlRecord};
use crate::storage::UrlStore;

pub fn url_key(code: &str) -> String {
    format!("url:{code}")
}

fn lock_key(code: &str) -> String {
    format!("lock:url:{code}")
}

#[derive(Debug, Default)]
pub struct LookupStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LookupStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate in percent; `None` before any lookups.
    pub fn hit_rate(&self) -> Option<f64> {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            None
        } else {
            Some(hits / total * 100.0)
        }
    }
}

pub struct LookupCache {
    pair: CachePair,
    store: Arc<dyn UrlStore>,
    ttl: Duration,
    lock_ttl: Duration,
    retry_count: u32,
    retry_delay: Duration,
    stats: LookupStats,
}

impl LookupCache {
    pub fn new(pair: CachePair, store: Arc<dyn UrlStore>, config: &CacheConfig) -> Self {
        Self {
            pair,
            store,
            ttl: Duration::from_secs(config.url_ttl_secs),
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            retry_count: config.lock_retry_count,
            retry_delay: Duration::from_millis(config.lock_retry_delay_ms),
            stats: LookupStats::default(),
        }
    }

    pub fn stats(&self) -> &LookupStats {
        &self.stats
    }

    pub async fn lookup(&self, code: &str) -> ZipResult<Option<UrlRecord>> {
        let key = url_key(code);

        match self.pair.reader.get(&key).await {
            Ok(Some(raw)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return decode_payload(code, &raw).map(Some);
            }
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(short_code = %code, error = %err, "cache read failed, falling back to store");
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return self.store.get(code).await.map_err(ZipError::from);
            }
        }

        match DistributedLock::try_acquire(&self.pair.writer, &lock_key(code), self.lock_ttl).await
        {
            Ok(Some(lock)) => {
                let fetched = self.store.get(code).await;
                if let Ok(Some(record)) = &fetched {
                    if let Err(err) = self.write(record).await {
                        warn!(short_code = %code, error = %err, "failed to populate lookup cache");
                    }
                }
                if let Err(err) = lock.release().await {
                    warn!(short_code = %code, error = %err, "failed to release lookup lock");
                }
                fetched.map_err(ZipError::from)
            }
            Ok(None) => {
                // Another task is refilling; poll the reader before falling
                // through to an unlocked store read.
                for _ in 0..self.retry_count {
                    tokio::time::sleep(self.retry_delay).await;
                    if let Ok(Some(raw)) = self.pair.reader.get(&key).await {
                        return decode_payload(code, &raw).map(Some);
                    }
                }
                self.store.get(code).await.map_err(ZipError::from)
            }
            Err(err) => {
                warn!(short_code = %code, error = %err, "lookup lock unavailable, reading store directly");
                self.store.get(code).await.map_err(ZipError::from)
            }
        }
    }

    /// SETEX the payload. Every path that authoritatively produces a record
    /// (create, lookup miss, warmer) goes through here.
    pub async fn write(&self, record: &UrlRecord) -> anyhow::Result<()> {
        let payload = serde_json::to_string(record)?;
        self.pair
            .writer
            .set_ex(&url_key(&record.short_code), &payload, self.ttl)
            .await
    }

    /// Drop the cached payload; the next reader repopulates via the
    /// single-flight path.
    pub async fn invalidate(&self, code: &str) -> anyhow::Result<()> {
        self.pair.writer.del(&url_key(code)).await
    }
}

fn decode_payload(code: &str, raw: &str) -> ZipResult<CachedUrlPayload> {
    serde_json::from_str(raw).map_err(|err| {
        ZipError::Internal(anyhow::anyhow!(
            "corrupt cache payload for '{code}': {err}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;
    use crate::config::CacheConfig;
    use crate::storage::{SqliteStore, UrlStore};

    fn cache_config() -> CacheConfig {
        CacheConfig {
            url: String::new(),
            replica_url: None,
            sentinel_hosts: None,
            sentinel_master_name: "mymaster".to_string(),
            url_ttl_secs: 3600,
            lock_ttl_secs: 3,
            lock_retry_count: 3,
            lock_retry_delay_ms: 10,
        }
    }

    async fn store_with(code: &str, url: &str) -> Arc<dyn UrlStore> {
        let store = SqliteStore::connect("sqlite::memory:", 5).await.unwrap();
        store.init().await.unwrap();
        store.insert(None, code, url).await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn miss_then_hit_round_trip() {
        let store = store_with("abc12345", "https://example.com").await;
        let backend = Arc::new(MemoryBackend::new());
        let lookup = LookupCache::new(
            CachePair::single(backend.clone()),
            store,
            &cache_config(),
        );

        let first = lookup.lookup("abc12345").await.unwrap().unwrap();
        assert_eq!(first.original_url, "https://example.com");
        assert_eq!(lookup.stats().misses(), 1);

        // Payload is now cached; the second read is a hit.
        let second = lookup.lookup("abc12345").await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(lookup.stats().hits(), 1);
    }

    #[tokio::test]
    async fn unknown_code_leaves_no_cache_entry() {
        let store = store_with("known000", "https://example.com").await;
        let backend = Arc::new(MemoryBackend::new());
        let lookup = LookupCache::new(
            CachePair::single(backend.clone()),
            store,
            &cache_config(),
        );

        assert!(lookup.lookup("missing0").await.unwrap().is_none());
        assert_eq!(backend.get("url:missing0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_outage_degrades_to_store_read() {
        let store = store_with("abc12345", "https://example.com").await;
        let backend = Arc::new(MemoryBackend::new());
        backend.set_failing(true);
        let lookup = LookupCache::new(
            CachePair::single(backend.clone()),
            store,
            &cache_config(),
        );

        let record = lookup.lookup("abc12345").await.unwrap().unwrap();
        assert_eq!(record.original_url, "https://example.com");
    }

    #[tokio::test]
    async fn stampede_produces_single_store_read() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let inner = store_with("hot00000", "https://example.com/hot").await;
        let reads = Arc::new(AtomicU64::new(0));
        let store: Arc<dyn UrlStore> = Arc::new(crate::storage::CountingStore::new(
            inner,
            Arc::clone(&reads),
        ));
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let lookup = Arc::new(LookupCache::new(
            CachePair::single(backend),
            store,
            &cache_config(),
        ));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let lookup = Arc::clone(&lookup);
            handles.push(tokio::spawn(async move {
                lookup.lookup("hot00000").await.unwrap().unwrap()
            }));
        }
        for handle in handles {
            let record = handle.await.unwrap();
            assert_eq!(record.original_url, "https://example.com/hot");
        }

        let observed = reads.load(Ordering::SeqCst);
        assert!(
            observed <= 2,
            "expected at most lock-holder + fall-through reads, got {observed}"
        );
    }
}
