//! Core shortening service: create, lookup, statistics and click tracking
//! over the cache pair, allocator blocks, lookup cache and click pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};
use url::Url;

use crate::allocator::CodeBlocks;
use crate::cache::{CacheBackend, CachePair, DistributedLock, LookupCache};
use crate::clicks::{ClickBuffer, FallbackStream};
use crate::codec;
use crate::config::Config;
use crate::error::{ZipError, ZipResult};
use crate::models::{ClickEvent, HealthResponse, HealthStatus, UrlRecord};
use crate::queue::ClickPublisher;
use crate::storage::{StoreError, UrlStore};

const MAX_URL_LENGTH: usize = 2048;
const MIN_CUSTOM_CODE_LENGTH: usize = 3;
const MAX_CUSTOM_CODE_LENGTH: usize = 20;

/// Attempts at regenerating a code when an allocator-produced code collides
/// with historic data.
const MAX_GENERATE_ATTEMPTS: usize = 16;

const FLUSH_LOCK_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    ValidationError,
    NotFound,
    Error,
}

/// Per-operation status counters plus cumulative duration, kept in
/// process-local atomics and cheap enough for the hot path.
#[derive(Debug, Default)]
pub struct OperationStats {
    success: AtomicU64,
    validation_error: AtomicU64,
    not_found: AtomicU64,
    error: AtomicU64,
    duration_micros: AtomicU64,
}

impl OperationStats {
    fn record(&self, outcome: Outcome, elapsed: Duration) {
        let counter = match outcome {
            Outcome::Success => &self.success,
            Outcome::ValidationError => &self.validation_error,
            Outcome::NotFound => &self.not_found,
            Outcome::Error => &self.error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.duration_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    pub fn not_found(&self) -> u64 {
        self.not_found.load(Ordering::Relaxed)
    }
}

fn classify<T>(result: &ZipResult<T>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(ZipError::InvalidArgument(_)) | Err(ZipError::Conflict(_)) => Outcome::ValidationError,
        Err(ZipError::NotFound) => Outcome::NotFound,
        Err(_) => Outcome::Error,
    }
}

#[derive(Debug, Default)]
pub struct ServiceStats {
    pub create: OperationStats,
    pub lookup: OperationStats,
    pub statistics: OperationStats,
    pub track_click: OperationStats,
    queue_published: AtomicU64,
    stream_fallbacks: AtomicU64,
}

impl ServiceStats {
    pub fn queue_published(&self) -> u64 {
        self.queue_published.load(Ordering::Relaxed)
    }

    pub fn stream_fallbacks(&self) -> u64 {
        self.stream_fallbacks.load(Ordering::Relaxed)
    }
}

pub struct ShortenerService {
    store: Arc<dyn UrlStore>,
    cache: CachePair,
    lookup: LookupCache,
    blocks: CodeBlocks,
    buffer: ClickBuffer,
    fallback: FallbackStream,
    publisher: Arc<dyn ClickPublisher>,
    code_length: usize,
    flush_threshold: i64,
    stats: ServiceStats,
}

impl ShortenerService {
    pub fn new(
        store: Arc<dyn UrlStore>,
        cache: CachePair,
        blocks: CodeBlocks,
        publisher: Arc<dyn ClickPublisher>,
        config: &Config,
    ) -> Self {
        let lookup = LookupCache::new(cache.clone(), Arc::clone(&store), &config.cache);
        let buffer = ClickBuffer::new(Arc::clone(&cache.writer), config.clicks.buffer_ttl_secs);
        let fallback = FallbackStream::new(Arc::clone(&cache.writer), &config.clicks.stream_key);
        Self {
            store,
            cache,
            lookup,
            blocks,
            buffer,
            fallback,
            publisher,
            code_length: config.short_code_length,
            flush_threshold: config.clicks.flush_threshold,
            stats: ServiceStats::default(),
        }
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    pub fn lookup_cache(&self) -> &LookupCache {
        &self.lookup
    }

    /// Shorten a URL, either under a validated custom code or under the
    /// next allocator-assigned code.
    pub async fn create(
        &self,
        original_url: &str,
        custom_code: Option<&str>,
    ) -> ZipResult<UrlRecord> {
        let started = Instant::now();
        let result = self.create_inner(original_url, custom_code).await;
        self.stats.create.record(classify(&result), started.elapsed());
        result
    }

    async fn create_inner(
        &self,
        original_url: &str,
        custom_code: Option<&str>,
    ) -> ZipResult<UrlRecord> {
        validate_url(original_url)?;

        if let Some(custom) = custom_code {
            validate_custom_code(custom)?;

            if self
                .store
                .exists(custom)
                .await
                .map_err(|err| ZipError::Unavailable(format!("store unreachable: {err}")))?
            {
                return Err(ZipError::Conflict(custom.to_string()));
            }

            let record = match self.store.insert(None, custom, original_url).await {
                Ok(record) => record,
                Err(StoreError::Conflict) => {
                    return Err(ZipError::Conflict(custom.to_string()));
                }
                Err(StoreError::Other(err)) => {
                    return Err(ZipError::Unavailable(format!("create failed: {err}")));
                }
            };
            self.populate_cache(&record).await;
            return Ok(record);
        }

        // Allocator path. Codes can collide with historic data in
        // mixed-mode deployments, so a conflict regenerates from the next
        // block id instead of failing the request.
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let id = self.blocks.next_id().await?;
            let code = codec::encode_padded(id, self.code_length)?;

            match self.store.insert(Some(id), &code, original_url).await {
                Ok(record) => {
                    self.populate_cache(&record).await;
                    return Ok(record);
                }
                Err(StoreError::Conflict) => {
                    warn!(short_code = %code, "generated code collided, regenerating");
                }
                Err(StoreError::Other(err)) => {
                    return Err(ZipError::Unavailable(format!("create failed: {err}")));
                }
            }
        }

        Err(ZipError::Internal(anyhow::anyhow!(
            "exhausted code generation attempts"
        )))
    }

    /// Resolve a code to its record via the stampede-protected cache.
    pub async fn lookup(&self, code: &str) -> ZipResult<Option<UrlRecord>> {
        let started = Instant::now();
        let result = self.lookup.lookup(code).await;
        let outcome = match &result {
            Ok(Some(_)) => Outcome::Success,
            Ok(None) => Outcome::NotFound,
            Err(_) => Outcome::Error,
        };
        self.stats.lookup.record(outcome, started.elapsed());
        result
    }

    /// Like `lookup`, but the returned record's `clicks` also counts the
    /// unflushed buffered delta. The persisted record is not mutated.
    pub async fn statistics(&self, code: &str) -> ZipResult<Option<UrlRecord>> {
        let started = Instant::now();
        let result = self.statistics_inner(code).await;
        let outcome = match &result {
            Ok(Some(_)) => Outcome::Success,
            Ok(None) => Outcome::NotFound,
            Err(_) => Outcome::Error,
        };
        self.stats.statistics.record(outcome, started.elapsed());
        result
    }

    async fn statistics_inner(&self, code: &str) -> ZipResult<Option<UrlRecord>> {
        let Some(mut record) = self.lookup.lookup(code).await? else {
            return Ok(None);
        };
        match self.buffer.buffered(code).await {
            Ok(buffered) => record.clicks += buffered,
            Err(err) => {
                warn!(short_code = %code, error = %err, "click buffer unreadable for statistics");
            }
        }
        Ok(Some(record))
    }

    /// Count one click: buffer increment, then fire-and-observe publish
    /// with the stream fallback. Never fails the redirect.
    pub async fn track_click(&self, code: &str) {
        let started = Instant::now();

        let buffered = match self.buffer.record(code).await {
            Ok(count) => count,
            Err(err) => {
                warn!(short_code = %code, error = %err, "failed to buffer click");
                0
            }
        };

        let event = ClickEvent::single(code);
        match self.publisher.publish(&event).await {
            Ok(()) => {
                self.stats.queue_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(publish_err) => {
                self.stats.stream_fallbacks.fetch_add(1, Ordering::Relaxed);
                if let Err(stream_err) = self.fallback.append(&event).await {
                    error!(
                        short_code = %code,
                        publish_error = %publish_err,
                        stream_error = %stream_err,
                        "click event lost: queue and fallback stream both failed"
                    );
                }
            }
        }

        if self.flush_threshold > 0 && buffered >= self.flush_threshold {
            if let Err(err) = self.flush_clicks(code).await {
                warn!(short_code = %code, error = %err, "on-demand click flush failed");
            }
        }

        self.stats
            .track_click
            .record(Outcome::Success, started.elapsed());
    }

    /// Opportunistic per-code flush under `lock:click_flush:<code>`.
    /// Non-blocking: returns immediately when the lock is held elsewhere.
    pub async fn flush_clicks(&self, code: &str) -> anyhow::Result<()> {
        let lock_key = format!("lock:click_flush:{code}");
        let Some(lock) =
            DistributedLock::try_acquire(&self.cache.writer, &lock_key, FLUSH_LOCK_TTL).await?
        else {
            return Ok(());
        };

        let result = self.flush_clicks_locked(code).await;

        if let Err(err) = lock.release().await {
            warn!(short_code = %code, error = %err, "failed to release click flush lock");
        }
        result
    }

    async fn flush_clicks_locked(&self, code: &str) -> anyhow::Result<()> {
        let buffered = self.buffer.buffered(code).await?;
        if buffered <= 0 {
            return Ok(());
        }
        self.store
            .add_clicks(&[(code.to_string(), buffered)])
            .await?;
        self.buffer.decrement(code, buffered).await?;
        self.lookup.invalidate(code).await?;
        Ok(())
    }

    async fn populate_cache(&self, record: &UrlRecord) {
        if let Err(err) = self.lookup.write(record).await {
            warn!(short_code = %record.short_code, error = %err, "failed to cache new record");
        }
    }

    pub async fn health(&self) -> HealthResponse {
        let database = match self.store.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let cache = match self.cache.writer.ping().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let status = if matches!(database, HealthStatus::Healthy)
            && matches!(cache, HealthStatus::Healthy)
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        HealthResponse {
            status,
            database,
            cache,
        }
    }
}

fn validate_url(raw: &str) -> ZipResult<()> {
    if raw.is_empty() {
        return Err(ZipError::InvalidArgument("url must not be empty".to_string()));
    }
    if raw.len() > MAX_URL_LENGTH {
        return Err(ZipError::InvalidArgument(format!(
            "url exceeds {MAX_URL_LENGTH} characters"
        )));
    }
    let parsed = Url::parse(raw)
        .map_err(|err| ZipError::InvalidArgument(format!("invalid url: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ZipError::InvalidArgument(
            "url scheme must be http or https".to_string(),
        ));
    }
    if parsed.host_str().is_none() {
        return Err(ZipError::InvalidArgument("url has no host".to_string()));
    }
    Ok(())
}

fn validate_custom_code(code: &str) -> ZipResult<()> {
    if code.len() < MIN_CUSTOM_CODE_LENGTH || code.len() > MAX_CUSTOM_CODE_LENGTH {
        return Err(ZipError::InvalidArgument(format!(
            "custom code must be between {MIN_CUSTOM_CODE_LENGTH} and {MAX_CUSTOM_CODE_LENGTH} characters"
        )));
    }
    if !codec::is_valid_code(code) {
        return Err(ZipError::InvalidArgument(
            "custom code must be alphanumeric".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation_boundaries() {
        assert!(validate_url("https://www.google.com").is_ok());
        assert!(validate_url("http://a.io/path?q=1").is_ok());
        assert!(validate_url("not-a-url").is_err());
        assert!(validate_url("ftp://files.example.com").is_err());
        assert!(validate_url("").is_err());
        let oversized = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert!(validate_url(&oversized).is_err());
    }

    #[test]
    fn custom_code_validation_boundaries() {
        assert!(validate_custom_code("abc").is_ok());
        assert!(validate_custom_code(&"a".repeat(20)).is_ok());
        assert!(validate_custom_code("ab").is_err());
        assert!(validate_custom_code(&"a".repeat(21)).is_err());
        assert!(validate_custom_code("my-code!").is_err());
    }
}
