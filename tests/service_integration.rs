//! Service-level integration tests over the in-memory cache backend, the
//! SQLite store and the in-process queue double.

use std::sync::Arc;
use std::time::{Duration, Instant};

use zipline::allocator::{CodeBlocks, IdAllocator};
use zipline::analytics::{ColumnarStore, MemoryColumnar};
use zipline::cache::{CacheBackend, CachePair, MemoryBackend};
use zipline::clicks::buffer_key;
use zipline::config::{
    AllocatorConfig, AnalyticsConfig, CacheConfig, ClickConfig, Config, DatabaseBackend,
    DatabaseConfig, IngestionConfig, QueueConfig, ServerConfig, WarmerConfig,
};
use zipline::error::ZipError;
use zipline::ingest::IngestionConsumer;
use zipline::queue::{ClickSource, MemoryQueue};
use zipline::service::ShortenerService;
use zipline::storage::{SqliteStore, UrlStore};

fn test_config() -> Config {
    Config {
        database: DatabaseConfig {
            backend: DatabaseBackend::Sqlite,
            url: "sqlite::memory:".to_string(),
            max_connections: 5,
        },
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        base_url: "http://localhost:8080".to_string(),
        cache: CacheConfig {
            url: String::new(),
            replica_url: None,
            sentinel_hosts: None,
            sentinel_master_name: "mymaster".to_string(),
            url_ttl_secs: 3600,
            lock_ttl_secs: 3,
            lock_retry_count: 3,
            lock_retry_delay_ms: 10,
        },
        allocator: AllocatorConfig {
            primary_redis_url: None,
            secondary_redis_url: None,
            block_size: 100,
            base: 1_000_000,
            lock_ttl_secs: 10,
            lock_retries: 5,
        },
        clicks: ClickConfig {
            buffer_ttl_secs: 300,
            flush_threshold: 100,
            stream_key: "click_events".to_string(),
        },
        queue: QueueConfig {
            bootstrap_servers: String::new(),
            click_topic: "click_events".to_string(),
        },
        ingestion: IngestionConfig {
            batch_size: 500,
            block_ms: 10,
            flush_interval_secs: 0,
            consumer_group: "click_ingestion_group".to_string(),
            consumer_name: Some("test-consumer".to_string()),
        },
        analytics: AnalyticsConfig {
            clickhouse_url: String::new(),
            clickhouse_username: String::new(),
            clickhouse_password: String::new(),
            clickhouse_database: String::new(),
        },
        warmer: WarmerConfig {
            interval_secs: 30,
            top_n: 100,
            newest_share: 0.3,
            buffer_share: 0.2,
            pregenerate: 0,
            random_sample: 0,
            target_keys: 0,
            hit_rate_threshold: 0.0,
        },
        short_code_length: 8,
    }
}

struct Fixture {
    service: ShortenerService,
    store: Arc<dyn UrlStore>,
    cache: Arc<MemoryBackend>,
    queue: Arc<MemoryQueue>,
    config: Config,
}

async fn fixture() -> Fixture {
    fixture_with(test_config()).await
}

async fn fixture_with(config: Config) -> Fixture {
    let sqlite = SqliteStore::connect_with_sequence(
        "sqlite::memory:",
        5,
        config.allocator.base,
        config.allocator.block_size,
    )
    .await
    .unwrap();
    sqlite.init().await.unwrap();
    let store: Arc<dyn UrlStore> = Arc::new(sqlite);

    let cache = Arc::new(MemoryBackend::new());
    let pair = CachePair::single(Arc::clone(&cache) as Arc<dyn CacheBackend>);
    let allocator = IdAllocator::new(
        Arc::clone(&cache) as Arc<dyn CacheBackend>,
        None,
        Arc::clone(&store),
        config.allocator.clone(),
    );
    let blocks = CodeBlocks::new(allocator, config.allocator.block_size);
    let queue = Arc::new(MemoryQueue::new());

    let service = ShortenerService::new(
        Arc::clone(&store),
        pair,
        blocks,
        Arc::clone(&queue) as Arc<dyn zipline::queue::ClickPublisher>,
        &config,
    );

    Fixture {
        service,
        store,
        cache,
        queue,
        config,
    }
}

fn ingestion_consumer(fx: &Fixture) -> IngestionConsumer {
    IngestionConsumer::new(
        Arc::clone(&fx.queue) as Arc<dyn ClickSource>,
        Arc::clone(&fx.cache) as Arc<dyn CacheBackend>,
        Arc::clone(&fx.store),
        Arc::new(MemoryColumnar::new()) as Arc<dyn ColumnarStore>,
        &fx.config.clicks.stream_key,
        fx.config.ingestion.clone(),
    )
}

#[tokio::test]
async fn create_then_lookup_round_trip() {
    let fx = fixture().await;

    let created = fx
        .service
        .create("https://www.google.com", None)
        .await
        .unwrap();
    assert_eq!(created.short_code.len(), 8);
    assert_eq!(created.clicks, 0);

    let found = fx.service.lookup(&created.short_code).await.unwrap().unwrap();
    assert_eq!(found.short_code, created.short_code);
    assert_eq!(found.original_url, "https://www.google.com");
    assert_eq!(found.id, created.id);
}

#[tokio::test]
async fn custom_code_round_trip_and_conflict() {
    let fx = fixture().await;

    let created = fx
        .service
        .create("https://a.example", Some("taken1"))
        .await
        .unwrap();
    assert_eq!(created.short_code, "taken1");

    let found = fx.service.lookup("taken1").await.unwrap().unwrap();
    assert_eq!(found.original_url, "https://a.example");

    let second = fx.service.create("https://b.example", Some("taken1")).await;
    assert!(matches!(second, Err(ZipError::Conflict(_))));
}

#[tokio::test]
async fn invalid_inputs_are_rejected() {
    let fx = fixture().await;

    assert!(matches!(
        fx.service.create("not-a-url", None).await,
        Err(ZipError::InvalidArgument(_))
    ));
    assert!(matches!(
        fx.service.create("https://x.example", Some("ab")).await,
        Err(ZipError::InvalidArgument(_))
    ));
    let long = "a".repeat(21);
    assert!(matches!(
        fx.service.create("https://x.example", Some(&long)).await,
        Err(ZipError::InvalidArgument(_))
    ));
    assert!(matches!(
        fx.service.create("https://x.example", Some("my-code!")).await,
        Err(ZipError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn generated_codes_are_unique_across_concurrent_creates() {
    let fx = Arc::new(fixture().await);

    let mut handles = Vec::new();
    for i in 0..50 {
        let fx = Arc::clone(&fx);
        handles.push(tokio::spawn(async move {
            fx.service
                .create(&format!("https://example.com/{i}"), None)
                .await
                .unwrap()
                .short_code
        }));
    }

    let mut codes = Vec::new();
    for handle in handles {
        codes.push(handle.await.unwrap());
    }
    codes.sort();
    codes.dedup();
    assert_eq!(codes.len(), 50);
}

#[tokio::test]
async fn statistics_include_buffered_clicks() {
    let fx = fixture().await;
    let created = fx.service.create("https://example.com", None).await.unwrap();

    for _ in 0..5 {
        fx.service.track_click(&created.short_code).await;
    }

    // Nothing has been flushed: the persisted record still reads 0 clicks,
    // while statistics fold in the buffer.
    let looked_up = fx.service.lookup(&created.short_code).await.unwrap().unwrap();
    let stats = fx
        .service
        .statistics(&created.short_code)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.clicks, 5);
    assert!(stats.clicks >= looked_up.clicks);
    assert_eq!(fx.queue.len().await, 5);
}

#[tokio::test]
async fn click_counts_survive_ingestion_flush() {
    let fx = fixture().await;
    let created = fx.service.create("https://example.com", None).await.unwrap();
    let code = created.short_code.clone();

    for _ in 0..5 {
        fx.service.track_click(&code).await;
    }

    // Drain the queue and flush, as the consumer loop would.
    let consumer = ingestion_consumer(&fx);
    let mut last_flush = Instant::now() - Duration::from_secs(60);
    consumer.iterate_once(&mut last_flush).await.unwrap();

    let persisted = fx.store.get(&code).await.unwrap().unwrap();
    assert_eq!(persisted.clicks, 5);

    // Buffer is drained and the cached payload was invalidated, so
    // statistics still report exactly 5.
    let stats = fx.service.statistics(&code).await.unwrap().unwrap();
    assert_eq!(stats.clicks, 5);

    let buffered = fx.cache.get(&buffer_key(&code)).await.unwrap();
    assert!(matches!(buffered.as_deref(), None | Some("0")));
}

#[tokio::test]
async fn queue_outage_routes_clicks_to_fallback_stream() {
    let fx = fixture().await;
    let created = fx.service.create("https://example.com", None).await.unwrap();
    let code = created.short_code.clone();

    fx.queue.set_failing(true);
    for _ in 0..3 {
        fx.service.track_click(&code).await;
    }
    assert_eq!(fx.queue.len().await, 0);
    assert_eq!(fx.service.stats().stream_fallbacks(), 3);

    // Consumer recovers every missed event from the stream.
    fx.queue.set_failing(false);
    let consumer = ingestion_consumer(&fx);
    let mut last_flush = Instant::now() - Duration::from_secs(60);
    consumer.iterate_once(&mut last_flush).await.unwrap();

    let persisted = fx.store.get(&code).await.unwrap().unwrap();
    assert_eq!(persisted.clicks, 3);
}

#[tokio::test]
async fn unknown_code_is_absent_everywhere() {
    let fx = fixture().await;
    assert!(fx.service.lookup("zzzzzzz1").await.unwrap().is_none());
    assert!(fx.service.statistics("zzzzzzz1").await.unwrap().is_none());
    assert_eq!(fx.cache.get("url:zzzzzzz1").await.unwrap(), None);
}

#[tokio::test]
async fn buffered_threshold_triggers_on_demand_flush() {
    let mut config = test_config();
    config.clicks.flush_threshold = 3;
    let fx = fixture_with(config).await;
    let created = fx.service.create("https://example.com", None).await.unwrap();
    let code = created.short_code.clone();

    for _ in 0..3 {
        fx.service.track_click(&code).await;
    }

    // The third click crossed the threshold and flushed under the
    // per-code flush lock.
    let persisted = fx.store.get(&code).await.unwrap().unwrap();
    assert_eq!(persisted.clicks, 3);
    let stats = fx.service.statistics(&code).await.unwrap().unwrap();
    assert_eq!(stats.clicks, 3);
}

#[tokio::test]
async fn flush_clicks_with_empty_buffer_is_a_no_op() {
    let fx = fixture().await;
    let created = fx.service.create("https://example.com", None).await.unwrap();

    fx.service.flush_clicks(&created.short_code).await.unwrap();
    let persisted = fx.store.get(&created.short_code).await.unwrap().unwrap();
    assert_eq!(persisted.clicks, 0);
}
