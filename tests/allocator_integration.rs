//! Allocator integration tests: disjointness under concurrency, fallback
//! behavior, counter restoration and code-shape invariants.

use std::sync::Arc;
use std::time::Duration;

use zipline::allocator::{AllocationSource, IdAllocator, ServiceHealth, MAX_BLOCK};
use zipline::cache::{CacheBackend, DistributedLock, MemoryBackend};
use zipline::codec;
use zipline::config::AllocatorConfig;
use zipline::error::ZipError;
use zipline::storage::{SqliteStore, UrlStore};

const SHORT_CODE_LENGTH: usize = 8;

fn allocator_config() -> AllocatorConfig {
    AllocatorConfig {
        primary_redis_url: None,
        secondary_redis_url: None,
        block_size: 1000,
        base: 1_000_000,
        lock_ttl_secs: 10,
        lock_retries: 5,
    }
}

async fn sqlite_store() -> Arc<dyn UrlStore> {
    let store = SqliteStore::connect("sqlite::memory:", 5).await.unwrap();
    store.init().await.unwrap();
    Arc::new(store)
}

async fn allocator_with(
    primary: Arc<dyn CacheBackend>,
    store: Arc<dyn UrlStore>,
) -> Arc<IdAllocator> {
    IdAllocator::new(primary, None, store, allocator_config())
}

#[tokio::test]
async fn hundred_concurrent_single_allocations_are_unique() {
    let allocator = allocator_with(Arc::new(MemoryBackend::new()), sqlite_store().await).await;

    let mut handles = Vec::new();
    for _ in 0..100 {
        let allocator = Arc::clone(&allocator);
        handles.push(tokio::spawn(async move {
            allocator.allocate_range(1).await.unwrap()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let range = handle.await.unwrap();
        assert_eq!(range.start, range.end);
        ids.push(range.start);
    }

    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 100, "all 100 allocations must be unique");
}

#[tokio::test]
async fn concurrent_mixed_size_ranges_never_overlap() {
    let allocator = allocator_with(Arc::new(MemoryBackend::new()), sqlite_store().await).await;

    let mut handles = Vec::new();
    for i in 0..40 {
        let allocator = Arc::clone(&allocator);
        let size = 1 + (i % 7) * 13;
        handles.push(tokio::spawn(async move {
            allocator.allocate_range(size).await.unwrap()
        }));
    }

    let mut ranges = Vec::new();
    for handle in handles {
        let range = handle.await.unwrap();
        assert!(range.start <= range.end);
        ranges.push((range.start, range.end));
    }

    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(
            pair[0].1 < pair[1].0,
            "ranges {:?} and {:?} overlap",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn sequential_allocations_are_contiguous() {
    let allocator = allocator_with(Arc::new(MemoryBackend::new()), sqlite_store().await).await;

    let first = allocator.allocate_range(100).await.unwrap();
    let second = allocator.allocate_range(100).await.unwrap();
    assert_eq!(first.start, 1_000_001);
    assert_eq!(first.end, 1_001_000);
    assert_eq!(second.start, first.end + 1);
}

#[tokio::test]
async fn size_bounds_are_rejected() {
    let allocator = allocator_with(Arc::new(MemoryBackend::new()), sqlite_store().await).await;

    assert!(matches!(
        allocator.allocate_range(0).await,
        Err(ZipError::InvalidArgument(_))
    ));
    assert!(matches!(
        allocator.allocate_range(-5).await,
        Err(ZipError::InvalidArgument(_))
    ));
    assert!(matches!(
        allocator.allocate_range(MAX_BLOCK + 1).await,
        Err(ZipError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn contended_lock_fails_fast_with_temporarily_unavailable() {
    let primary: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
    let store = sqlite_store().await;
    let allocator = IdAllocator::new(
        Arc::clone(&primary),
        None,
        store,
        AllocatorConfig {
            lock_retries: 1,
            ..allocator_config()
        },
    );

    // A foreign holder keeps the allocation lock for longer than the
    // retry budget.
    let _held = DistributedLock::try_acquire(
        &primary,
        "id_allocation_lock",
        Duration::from_secs(30),
    )
    .await
    .unwrap()
    .unwrap();

    let result = allocator.allocate_range(10).await;
    assert!(matches!(result, Err(ZipError::TemporarilyUnavailable(_))));
}

#[tokio::test]
async fn primary_outage_falls_back_to_store_sequence() {
    let primary = Arc::new(MemoryBackend::new());
    primary.set_failing(true);
    let allocator = allocator_with(
        Arc::clone(&primary) as Arc<dyn CacheBackend>,
        sqlite_store().await,
    )
    .await;

    let range = allocator.allocate_range(50).await.unwrap();
    assert_eq!(range.source, AllocationSource::Oltp);
    assert_eq!(range.end - range.start + 1, 50);
    assert_eq!(allocator.health(), ServiceHealth::Degraded);

    // Primary recovers; allocation returns to the locked counter path and
    // health follows.
    primary.set_failing(false);
    let recovered = allocator.allocate_range(10).await.unwrap();
    assert_eq!(recovered.source, AllocationSource::PrimaryCache);
    assert_eq!(allocator.health(), ServiceHealth::Healthy);
}

#[tokio::test]
async fn secondary_backend_is_tried_before_the_store() {
    let primary = Arc::new(MemoryBackend::new());
    primary.set_failing(true);
    let secondary: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
    let allocator = IdAllocator::new(
        Arc::clone(&primary) as Arc<dyn CacheBackend>,
        Some(Arc::clone(&secondary)),
        sqlite_store().await,
        allocator_config(),
    );

    let range = allocator.allocate_range(25).await.unwrap();
    assert_eq!(range.source, AllocationSource::SecondaryCache);
    assert!(range.start > 1_000_000, "secondary ranges clear the base");
    assert_eq!(range.end - range.start + 1, 25);
}

#[tokio::test]
async fn counter_restores_from_audit_table_after_cache_wipe() {
    let store = sqlite_store().await;

    // First process: allocate and persist the audit trail.
    let first_cache: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
    let first = allocator_with(Arc::clone(&first_cache), Arc::clone(&store)).await;
    let granted = first.allocate_range(500).await.unwrap();
    let records = zipline::storage::AllocationRecord {
        start_id: granted.start,
        end_id: granted.end,
        range_size: 500,
        allocated_at: chrono::Utc::now(),
        source: "primary_cache".to_string(),
    };
    store.record_allocations(&[records]).await.unwrap();

    // Second process with an empty cache: the counter resumes past the
    // highest audited end, so ranges never repeat.
    let second = allocator_with(Arc::new(MemoryBackend::new()), store).await;
    let resumed = second.allocate_range(10).await.unwrap();
    assert!(resumed.start > granted.end);
}

#[tokio::test]
async fn allocated_ids_encode_to_full_width_codes() {
    let allocator = allocator_with(Arc::new(MemoryBackend::new()), sqlite_store().await).await;

    let range = allocator.allocate_range(100).await.unwrap();
    for id in range.start..=range.end {
        let code = codec::encode_padded(id, SHORT_CODE_LENGTH).unwrap();
        assert!(code.len() >= SHORT_CODE_LENGTH);
        assert!(codec::is_valid_code(&code));
        assert_eq!(codec::decode(&code).unwrap(), id);
    }
}
