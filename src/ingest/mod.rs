//! Ingestion consumer: drains the click queue and the fallback stream,
//! aggregates deltas per code, and commits batched updates to the OLTP and
//! columnar stores.
//!
//! Aggregates are spilled into the per-consumer cache hash
//! `ingestion_agg:<consumer>` between flushes, so a crashed consumer's
//! partial batch survives for its replacement. Delivery is at-least-once
//! end to end; per-code monotonicity of the persisted count comes from the
//! additive `clicks = clicks + delta` update.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analytics::{ClickEventRow, ColumnarStore};
use crate::cache::lookup::url_key;
use crate::cache::CacheBackend;
use crate::clicks::{buffer_key, FallbackStream};
use crate::config::IngestionConfig;
use crate::queue::ClickSource;
use crate::storage::UrlStore;

pub fn agg_key(consumer: &str) -> String {
    format!("ingestion_agg:{consumer}")
}

pub struct IngestionConsumer {
    source: Arc<dyn ClickSource>,
    cache: Arc<dyn CacheBackend>,
    store: Arc<dyn UrlStore>,
    columnar: Arc<dyn ColumnarStore>,
    fallback: FallbackStream,
    config: IngestionConfig,
    consumer_name: String,
}

impl IngestionConsumer {
    pub fn new(
        source: Arc<dyn ClickSource>,
        cache: Arc<dyn CacheBackend>,
        store: Arc<dyn UrlStore>,
        columnar: Arc<dyn ColumnarStore>,
        stream_key: &str,
        config: IngestionConfig,
    ) -> Self {
        let consumer_name = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("ingestion-{}", Uuid::new_v4().simple()));
        let fallback = FallbackStream::new(Arc::clone(&cache), stream_key);
        Self {
            source,
            cache,
            store,
            columnar,
            fallback,
            config,
            consumer_name,
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.columnar.ensure_schema().await {
            warn!(error = %err, "columnar schema not ready, will retry on flush");
        }
        if let Err(err) = self.fallback.ensure_group(&self.config.consumer_group).await {
            warn!(error = %err, "failed to create fallback consumer group");
        }
        info!(consumer = %self.consumer_name, "ingestion consumer started");

        let mut last_flush = Instant::now();
        loop {
            let stop = tokio::select! {
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
                result = self.iterate_once(&mut last_flush) => {
                    if let Err(err) = result {
                        error!(error = %err, "ingestion iteration failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    false
                }
            };
            if stop {
                if let Err(err) = self.flush().await {
                    error!(error = %err, "final ingestion flush failed");
                }
                info!(consumer = %self.consumer_name, "ingestion consumer stopped");
                return;
            }
        }
    }

    /// One poll-aggregate-spill cycle plus a flush when due. Public so a
    /// harness can drive the consumer without the outer loop.
    pub async fn iterate_once(&self, last_flush: &mut Instant) -> Result<()> {
        let block = Duration::from_millis(self.config.block_ms);

        let events = self
            .source
            .poll(self.config.batch_size, block)
            .await
            .context("queue poll failed")?;

        let mut aggregates: HashMap<String, i64> = HashMap::new();
        for event in &events {
            *aggregates.entry(event.short_code.clone()).or_insert(0) += event.delta;
        }

        let fallback_events = self
            .fallback
            .drain(
                &self.config.consumer_group,
                &self.consumer_name,
                self.config.batch_size,
                Duration::from_millis(10),
            )
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "fallback stream drain failed");
                Vec::new()
            });
        for event in &fallback_events {
            *aggregates.entry(event.short_code.clone()).or_insert(0) += event.delta;
        }

        // The aggregation map is bounded by the batch size; hitting the
        // bound forces an immediate flush.
        let force_flush = aggregates.len() >= self.config.batch_size;
        self.spill(aggregates).await?;

        if force_flush
            || last_flush.elapsed() >= Duration::from_secs(self.config.flush_interval_secs)
        {
            let flushed = self.flush().await?;
            if flushed > 0 {
                debug!(codes = flushed, "flushed aggregated clicks");
            }
            *last_flush = Instant::now();
        }
        Ok(())
    }

    /// Crash-resilient spill of the in-memory aggregates into the
    /// per-consumer cache hash.
    async fn spill(&self, aggregates: HashMap<String, i64>) -> Result<()> {
        if aggregates.is_empty() {
            return Ok(());
        }
        let key = agg_key(&self.consumer_name);
        for (short_code, delta) in aggregates {
            self.cache
                .hincr_by(&key, &short_code, delta)
                .await
                .context("failed to spill aggregate")?;
        }
        Ok(())
    }

    /// Commit everything in the spill hash: one OLTP transaction of
    /// additive updates, buffer decrements, lookup-cache invalidation, and
    /// the columnar insert. An empty or zero-valued hash is a no-op with no
    /// OLTP write.
    pub async fn flush(&self) -> Result<usize> {
        let key = agg_key(&self.consumer_name);
        let fields = self.cache.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(0);
        }

        let deltas: Vec<(String, i64)> = fields
            .into_iter()
            .filter_map(|(short_code, raw)| {
                let delta = raw.parse::<i64>().ok()?;
                (delta > 0).then_some((short_code, delta))
            })
            .collect();

        if deltas.is_empty() {
            self.cache.del(&key).await?;
            return Ok(0);
        }

        self.store
            .add_clicks(&deltas)
            .await
            .context("failed to apply click deltas")?;

        let event_time = Utc::now().timestamp() as u32;
        let mut rows = Vec::with_capacity(deltas.len());
        for (short_code, delta) in &deltas {
            if let Err(err) = self.cache.decr_by(&buffer_key(short_code), *delta).await {
                warn!(short_code = %short_code, error = %err, "failed to decrement click buffer");
            }
            if let Err(err) = self.cache.del(&url_key(short_code)).await {
                warn!(short_code = %short_code, error = %err, "failed to invalidate lookup cache");
            }
            rows.push(ClickEventRow {
                short_code: short_code.clone(),
                delta: (*delta).min(u32::MAX as i64) as u32,
                event_time,
            });
        }

        if let Err(err) = self.columnar.ensure_schema().await {
            warn!(error = %err, "columnar schema check failed");
        }
        if let Err(err) = self.columnar.insert_clicks(&rows).await {
            // OLTP already committed; analytics rows for this flush are lost.
            error!(error = %err, "columnar insert failed");
        }

        self.cache.del(&key).await?;
        Ok(deltas.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::MemoryColumnar;
    use crate::cache::MemoryBackend;
    use crate::clicks::ClickBuffer;
    use crate::models::ClickEvent;
    use crate::queue::{ClickPublisher, MemoryQueue};
    use crate::storage::SqliteStore;

    struct Fixture {
        consumer: IngestionConsumer,
        queue: Arc<MemoryQueue>,
        cache: Arc<dyn CacheBackend>,
        store: Arc<dyn UrlStore>,
        columnar: Arc<MemoryColumnar>,
    }

    async fn fixture() -> Fixture {
        let sqlite = SqliteStore::connect("sqlite::memory:", 5).await.unwrap();
        sqlite.init().await.unwrap();
        let store: Arc<dyn UrlStore> = Arc::new(sqlite);
        store.insert(None, "abc", "https://a").await.unwrap();
        store.insert(None, "def", "https://b").await.unwrap();

        let queue = Arc::new(MemoryQueue::new());
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let columnar = Arc::new(MemoryColumnar::new());
        let consumer = IngestionConsumer::new(
            Arc::clone(&queue) as Arc<dyn ClickSource>,
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&columnar) as Arc<dyn ColumnarStore>,
            "click_events",
            IngestionConfig {
                batch_size: 500,
                block_ms: 10,
                flush_interval_secs: 0,
                consumer_group: "click_ingestion_group".to_string(),
                consumer_name: Some("test-consumer".to_string()),
            },
        );
        Fixture {
            consumer,
            queue,
            cache,
            store,
            columnar,
        }
    }

    #[tokio::test]
    async fn queue_events_flow_to_stores_and_clear_buffers() {
        let fx = fixture().await;

        // Simulate the request path: buffered clicks plus queue events.
        let buffer = ClickBuffer::new(Arc::clone(&fx.cache), 300);
        for _ in 0..3 {
            buffer.record("abc").await.unwrap();
            fx.queue.publish(&ClickEvent::single("abc")).await.unwrap();
        }
        fx.cache
            .set_ex(&url_key("abc"), "{}", Duration::from_secs(60))
            .await
            .unwrap();

        let mut last_flush = Instant::now() - Duration::from_secs(60);
        fx.consumer.iterate_once(&mut last_flush).await.unwrap();

        let record = fx.store.get("abc").await.unwrap().unwrap();
        assert_eq!(record.clicks, 3);
        // Buffer decremented to zero and cache entry invalidated.
        assert_eq!(buffer.buffered("abc").await.unwrap(), 0);
        assert_eq!(fx.cache.get(&url_key("abc")).await.unwrap(), None);
        // Spill hash removed after commit.
        assert!(fx
            .cache
            .hgetall(&agg_key("test-consumer"))
            .await
            .unwrap()
            .is_empty());

        let rows = fx.columnar.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].short_code, "abc");
        assert_eq!(rows[0].delta, 3);
    }

    #[tokio::test]
    async fn fallback_stream_events_are_recovered() {
        let fx = fixture().await;

        // Queue outage: the request path appended to the stream instead.
        let stream = FallbackStream::new(Arc::clone(&fx.cache), "click_events");
        for _ in 0..5 {
            stream.append(&ClickEvent::single("def")).await.unwrap();
        }

        let mut last_flush = Instant::now() - Duration::from_secs(60);
        fx.consumer.iterate_once(&mut last_flush).await.unwrap();

        let record = fx.store.get("def").await.unwrap().unwrap();
        assert_eq!(record.clicks, 5);
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let fx = fixture().await;
        assert_eq!(fx.consumer.flush().await.unwrap(), 0);
        assert!(fx.columnar.rows().await.is_empty());
    }

    #[tokio::test]
    async fn mixed_sources_aggregate_per_code() {
        let fx = fixture().await;
        let stream = FallbackStream::new(Arc::clone(&fx.cache), "click_events");

        fx.queue.publish(&ClickEvent::single("abc")).await.unwrap();
        fx.queue.publish(&ClickEvent::single("abc")).await.unwrap();
        stream.append(&ClickEvent::single("abc")).await.unwrap();
        fx.queue.publish(&ClickEvent::single("def")).await.unwrap();

        let mut last_flush = Instant::now() - Duration::from_secs(60);
        fx.consumer.iterate_once(&mut last_flush).await.unwrap();

        assert_eq!(fx.store.get("abc").await.unwrap().unwrap().clicks, 3);
        assert_eq!(fx.store.get("def").await.unwrap().unwrap().clicks, 1);
    }
}
