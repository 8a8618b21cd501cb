//! End-to-end HTTP tests over the axum router with in-memory backends.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use zipline::allocator::{CodeBlocks, IdAllocator};
use zipline::api::{create_router, AppState};
use zipline::cache::{CacheBackend, CachePair, MemoryBackend};
use zipline::config::{
    AllocatorConfig, AnalyticsConfig, CacheConfig, ClickConfig, Config, DatabaseBackend,
    DatabaseConfig, IngestionConfig, QueueConfig, ServerConfig, WarmerConfig,
};
use zipline::queue::{ClickPublisher, MemoryQueue};
use zipline::service::ShortenerService;
use zipline::storage::{SqliteStore, UrlStore};

const SHORT_CODE_LENGTH: usize = 8;

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
            flush_interval_secs: 5,
            consumer_group: "click_ingestion_group".to_string(),
            consumer_name: Some("api-test-consumer".to_string()),
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
        short_code_length: SHORT_CODE_LENGTH,
    }
}

async fn test_router() -> Router {
    let config = test_config();

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

    let cache: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
    let pair = CachePair::single(Arc::clone(&cache));
    let allocator = IdAllocator::new(
        Arc::clone(&cache),
        None,
        Arc::clone(&store),
        config.allocator.clone(),
    );
    let blocks = CodeBlocks::new(allocator, config.allocator.block_size);
    let queue: Arc<dyn ClickPublisher> = Arc::new(MemoryQueue::new());

    let service = Arc::new(ShortenerService::new(store, pair, blocks, queue, &config));
    create_router(Arc::new(AppState {
        service,
        base_url: config.base_url.clone(),
    }))
}

async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Option<String>, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let location = response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, location, value)
}

#[tokio::test]
async fn shorten_then_redirect_then_stats() {
    let router = test_router().await;

    let (status, body) = post_json(
        &router,
        "/api/shorten",
        json!({"url": "https://www.google.com"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let code = body["short_code"].as_str().unwrap().to_string();
    assert_eq!(code.len(), SHORT_CODE_LENGTH);
    assert_eq!(body["original_url"], "https://www.google.com");
    assert!(body["short_url"].as_str().unwrap().ends_with(&code));

    let (status, location, _) = get(&router, &format!("/{code}")).await;
    assert_eq!(status, StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location.as_deref(), Some("https://www.google.com"));

    let (status, _, stats) = get(&router, &format!("/api/stats/{code}")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        stats["clicks"].as_i64().unwrap() >= 1,
        "buffered click must show up in stats"
    );
}

#[tokio::test]
async fn custom_code_collision_returns_conflict() {
    let router = test_router().await;

    let (status, _) = post_json(
        &router,
        "/api/shorten",
        json!({"url": "https://a.example", "custom_code": "taken1"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = post_json(
        &router,
        "/api/shorten",
        json!({"url": "https://b.example", "custom_code": "taken1"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("taken1"));
}

#[tokio::test]
async fn invalid_inputs_return_unprocessable_entity() {
    let router = test_router().await;

    let cases = [
        json!({"url": "not-a-url"}),
        json!({"url": "https://x.example", "custom_code": "ab"}),
        json!({"url": "https://x.example", "custom_code": "a".repeat(21)}),
        json!({"url": "https://x.example", "custom_code": "my-code!"}),
    ];
    for case in cases {
        let (status, body) = post_json(&router, "/api/shorten", case.clone()).await;
        assert_eq!(
            status,
            StatusCode::UNPROCESSABLE_ENTITY,
            "payload {case} must be rejected"
        );
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn unknown_code_returns_not_found() {
    let router = test_router().await;

    let (status, _, _) = get(&router, "/nosuchc0").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = get(&router, "/api/stats/nosuchc0").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_backend_status() {
    let router = test_router().await;

    let (status, _, body) = get(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "healthy");
    assert_eq!(body["cache"], "healthy");
}

#[tokio::test]
async fn redirect_preserves_method_semantics() {
    let router = test_router().await;

    let (_, body) = post_json(
        &router,
        "/api/shorten",
        json!({"url": "https://example.com/form"}),
    )
    .await;
    let code = body["short_code"].as_str().unwrap().to_string();

    // 307 keeps the method: a POST to the short link must redirect with
    // the same status code as a GET.
    let request = Request::builder()
        .method("POST")
        .uri(format!("/{code}"))
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
}

#[tokio::test]
async fn concurrent_redirects_to_one_hot_code_all_succeed() {
    let router = test_router().await;

    let (_, body) = post_json(&router, "/api/shorten", json!({"url": "https://hot.example"}))
        .await;
    let code = body["short_code"].as_str().unwrap().to_string();

    let mut handles = Vec::new();
    for _ in 0..200 {
        let router = router.clone();
        let uri = format!("/{code}");
        handles.push(tokio::spawn(async move {
            let request = Request::builder().uri(&uri).body(Body::empty()).unwrap();
            router.oneshot(request).await.unwrap().status()
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::TEMPORARY_REDIRECT);
    }

    let (status, _, stats) = get(&router, &format!("/api/stats/{code}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["clicks"].as_i64().unwrap(), 200);
}
