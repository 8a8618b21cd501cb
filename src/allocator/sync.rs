//! Background sync of pending allocation records into the OLTP audit table.
//!
//! One worker per process drains the allocator's bounded deque with batched
//! `ON CONFLICT DO NOTHING` inserts. Flush cadence adapts to allocation
//! load, with age and buffer-pressure triggers; worker errors feed an outer
//! backoff and never reach any caller.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::service::{IdAllocator, PendingAllocation};
use crate::storage::AllocationRecord;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RECORD_AGE: Duration = Duration::from_secs(60);
const PRESSURE_THRESHOLD: usize = 800;
const INSERT_CHUNK: usize = 500;

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX_ATTEMPTS: u32 = 3;

const OUTER_BACKOFF_BASE: Duration = Duration::from_secs(1);
const OUTER_BACKOFF_CAP: Duration = Duration::from_secs(30);
const OUTER_ERROR_LIMIT: u32 = 10;
const OUTER_ERROR_PAUSE: Duration = Duration::from_secs(60);

/// Pending-record count that triggers a flush at the observed allocation
/// rate (allocations per second).
fn flush_threshold(rate: f64) -> usize {
    if rate > 5000.0 {
        100
    } else if rate >= 1000.0 {
        500
    } else {
        1000
    }
}

fn to_records(batch: &[PendingAllocation]) -> Vec<AllocationRecord> {
    batch
        .iter()
        .map(|p| AllocationRecord {
            start_id: p.start_id,
            end_id: p.end_id,
            range_size: p.range_size,
            allocated_at: p.allocated_at,
            source: p.source.as_str().to_string(),
        })
        .collect()
}

pub fn spawn_sync_worker(
    allocator: Arc<IdAllocator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        drain_remaining(&allocator).await;
                        info!("allocation sync worker stopped");
                        return;
                    }
                }
            }

            let pending = allocator.pending_len();
            if pending == 0 {
                continue;
            }

            let threshold = flush_threshold(allocator.allocation_rate());
            let aged = allocator
                .oldest_pending_age()
                .is_some_and(|age| age > MAX_RECORD_AGE);
            if pending < threshold && pending <= PRESSURE_THRESHOLD && !aged {
                continue;
            }

            match flush_once(&allocator).await {
                Ok(flushed) => {
                    consecutive_errors = 0;
                    debug!(flushed, "synced allocation records");
                }
                Err(err) => {
                    consecutive_errors += 1;
                    error!(
                        error = %err,
                        consecutive_errors,
                        "allocation sync flush failed"
                    );
                    if consecutive_errors >= OUTER_ERROR_LIMIT {
                        warn!("allocation sync worker pausing after repeated errors");
                        tokio::time::sleep(OUTER_ERROR_PAUSE).await;
                        consecutive_errors = 0;
                    } else {
                        let backoff = OUTER_BACKOFF_BASE
                            .saturating_mul(1u32 << (consecutive_errors - 1).min(5))
                            .min(OUTER_BACKOFF_CAP);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    })
}

/// Drain one chunk with inner retries. Failed batches are re-queued if the
/// deque still has capacity.
async fn flush_once(allocator: &Arc<IdAllocator>) -> anyhow::Result<usize> {
    let batch = allocator.drain_pending(INSERT_CHUNK);
    if batch.is_empty() {
        return Ok(0);
    }
    let records = to_records(&batch);

    let mut attempt: u32 = 0;
    loop {
        match allocator.store().record_allocations(&records).await {
            Ok(()) => return Ok(records.len()),
            Err(err) if attempt < RETRY_MAX_ATTEMPTS => {
                attempt += 1;
                let jitter = rand::rng().random_range(0.8..1.2);
                let delay = RETRY_BASE
                    .saturating_mul(1u32 << (attempt - 1))
                    .mul_f64(jitter);
                warn!(error = %err, attempt, "audit insert failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                allocator.requeue_pending(batch);
                return Err(err);
            }
        }
    }
}

/// Final best-effort drain during shutdown.
async fn drain_remaining(allocator: &Arc<IdAllocator>) {
    loop {
        let batch = allocator.drain_pending(INSERT_CHUNK);
        if batch.is_empty() {
            return;
        }
        let records = to_records(&batch);
        if let Err(err) = allocator.store().record_allocations(&records).await {
            warn!(error = %err, dropped = records.len(), "shutdown drain lost audit records");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_follow_load() {
        assert_eq!(flush_threshold(0.0), 1000);
        assert_eq!(flush_threshold(999.0), 1000);
        assert_eq!(flush_threshold(1000.0), 500);
        assert_eq!(flush_threshold(4999.0), 500);
        assert_eq!(flush_threshold(5001.0), 100);
    }
}
