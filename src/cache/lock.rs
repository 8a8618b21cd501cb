//! Short-lived distributed locks with unique owner tokens.
//!
//! A lock is a cache entry whose value is a uuid owned by the acquirer; the
//! TTL bounds the blast radius of a crashed holder. Release goes through the
//! backend's compare-and-delete so a holder never deletes a lock it lost to
//! expiry.

use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::backend::CacheBackend;

pub struct DistributedLock {
    cache: Arc<dyn CacheBackend>,
    key: String,
    token: String,
}

impl DistributedLock {
    /// One acquisition attempt; `None` when the lock is held elsewhere.
    pub async fn try_acquire(
        cache: &Arc<dyn CacheBackend>,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        let token = Uuid::new_v4().to_string();
        if cache.set_nx_ex(key, &token, ttl).await? {
            Ok(Some(Self {
                cache: Arc::clone(cache),
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Acquire with exponential backoff and jitter. Each delay is capped at
    /// `ttl / retries / 2` so the retry loop cannot outlive a holder's TTL.
    /// Fails fast with `None` once retries are exhausted.
    pub async fn acquire(
        cache: &Arc<dyn CacheBackend>,
        key: &str,
        ttl: Duration,
        retries: u32,
    ) -> Result<Option<Self>> {
        let cap = ttl / (retries.max(1) * 2);

        for attempt in 0..=retries {
            if let Some(lock) = Self::try_acquire(cache, key, ttl).await? {
                return Ok(Some(lock));
            }
            if attempt == retries {
                break;
            }

            let base = Duration::from_millis(25).saturating_mul(1u32 << attempt.min(10));
            let delay = base.min(cap);
            let jitter = rand::rng().random_range(0.8..1.2);
            tokio::time::sleep(delay.mul_f64(jitter)).await;
        }

        Ok(None)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Compare-and-delete release; `false` means the lock had already
    /// expired or been taken over.
    pub async fn release(self) -> Result<bool> {
        self.cache.del_if_equals(&self.key, &self.token).await
    }
}
