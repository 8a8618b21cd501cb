pub mod kafka;

pub use kafka::{KafkaClickPublisher, KafkaClickSource};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::models::ClickEvent;

/// At-most-once click publisher. An error tells the caller to fall back to
/// the cache stream; it is a signal, not a failure of the redirect.
#[async_trait]
pub trait ClickPublisher: Send + Sync {
    async fn publish(&self, event: &ClickEvent) -> Result<()>;
}

/// Batched click consumption for the ingestion loop.
#[async_trait]
pub trait ClickSource: Send + Sync {
    /// Poll up to `max` events, waiting at most `timeout` for the first.
    async fn poll(&self, max: usize, timeout: Duration) -> Result<Vec<ClickEvent>>;
}

/// Publisher used when no queue is configured: every publish refuses, so
/// all clicks take the fallback stream.
pub struct DisabledPublisher;

#[async_trait]
impl ClickPublisher for DisabledPublisher {
    async fn publish(&self, _event: &ClickEvent) -> Result<()> {
        Err(anyhow!("click queue not configured"))
    }
}

/// In-process queue double for tests and single-node runs: publishes land
/// in a deque the paired source drains.
pub struct MemoryQueue {
    events: Mutex<VecDeque<ClickEvent>>,
    failing: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Simulate a queue outage: publishes fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClickPublisher for MemoryQueue {
    async fn publish(&self, event: &ClickEvent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("queue unavailable"));
        }
        self.events.lock().await.push_back(event.clone());
        Ok(())
    }
}

#[async_trait]
impl ClickSource for MemoryQueue {
    async fn poll(&self, max: usize, _timeout: Duration) -> Result<Vec<ClickEvent>> {
        let mut events = self.events.lock().await;
        let take = events.len().min(max);
        Ok(events.drain(..take).collect())
    }
}
