//! Cache-side click buffer and the durable fallback stream.
//!
//! The buffer is a plain integer counter per code (`click_buffer:<code>`)
//! absorbing clicks between ingestion flushes; `INCR` is atomic so the
//! request path needs no lock. The fallback stream carries click events
//! only while the primary queue is unavailable and is consumed through a
//! consumer group with per-entry acks.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cache::{CacheBackend, StreamEntry};
use crate::models::ClickEvent;

pub fn buffer_key(code: &str) -> String {
    format!("click_buffer:{code}")
}

pub struct ClickBuffer {
    writer: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl ClickBuffer {
    pub fn new(writer: Arc<dyn CacheBackend>, ttl_secs: u64) -> Self {
        Self {
            writer,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Count one click; the first increment after a flush arms the TTL.
    /// Returns the buffered total for this code.
    pub async fn record(&self, code: &str) -> Result<i64> {
        let key = buffer_key(code);
        let count = self.writer.incr_by(&key, 1).await?;
        if count == 1 {
            if let Err(err) = self.writer.expire(&key, self.ttl).await {
                warn!(short_code = %code, error = %err, "failed to arm click buffer ttl");
            }
        }
        Ok(count)
    }

    /// Buffered delta for `code`. An in-flight flush can leave the counter
    /// transiently negative; readers see `max(0, value)`.
    pub async fn buffered(&self, code: &str) -> Result<i64> {
        let value = self
            .writer
            .get(&buffer_key(code))
            .await?
            .map(|raw| raw.parse::<i64>())
            .transpose()
            .map_err(|_| anyhow!("click buffer for '{code}' is not an integer"))?
            .unwrap_or(0);
        Ok(value.max(0))
    }

    pub async fn decrement(&self, code: &str, delta: i64) -> Result<i64> {
        self.writer.decr_by(&buffer_key(code), delta).await
    }

    pub async fn delete(&self, code: &str) -> Result<()> {
        self.writer.del(&buffer_key(code)).await
    }
}

pub struct FallbackStream {
    writer: Arc<dyn CacheBackend>,
    key: String,
}

impl FallbackStream {
    pub fn new(writer: Arc<dyn CacheBackend>, key: &str) -> Self {
        Self {
            writer,
            key: key.to_string(),
        }
    }

    pub async fn append(&self, event: &ClickEvent) -> Result<()> {
        let delta = event.delta.to_string();
        self.writer
            .xadd(
                &self.key,
                &[("short_code", event.short_code.as_str()), ("delta", &delta)],
            )
            .await?;
        Ok(())
    }

    pub async fn ensure_group(&self, group: &str) -> Result<()> {
        self.writer.xgroup_create(&self.key, group).await
    }

    /// Read pending entries for this consumer and ack them after parsing.
    /// Malformed entries are acked and dropped with a warning.
    pub async fn drain(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<ClickEvent>> {
        let entries = self
            .writer
            .xread_group(&self.key, group, consumer, count, block)
            .await?;

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match parse_entry(&entry) {
                Some(event) => events.push(event),
                None => {
                    warn!(entry_id = %entry.id, "dropping malformed fallback stream entry");
                }
            }
            self.writer.xack(&self.key, group, &entry.id).await?;
        }
        Ok(events)
    }
}

fn parse_entry(entry: &StreamEntry) -> Option<ClickEvent> {
    let short_code = entry.field("short_code")?.to_string();
    if short_code.is_empty() {
        return None;
    }
    let delta = entry.field("delta")?.parse::<i64>().ok()?;
    if delta < 1 {
        return None;
    }
    Some(ClickEvent { short_code, delta })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBackend;

    #[tokio::test]
    async fn buffer_counts_and_clamps_negative() {
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let buffer = ClickBuffer::new(Arc::clone(&cache), 300);

        assert_eq!(buffer.record("abc").await.unwrap(), 1);
        assert_eq!(buffer.record("abc").await.unwrap(), 2);
        assert_eq!(buffer.buffered("abc").await.unwrap(), 2);

        // Flush decrement racing an in-flight increment can undershoot.
        buffer.decrement("abc", 3).await.unwrap();
        assert_eq!(buffer.buffered("abc").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fallback_stream_round_trip() {
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        let stream = FallbackStream::new(Arc::clone(&cache), "click_events");
        stream.ensure_group("group").await.unwrap();

        stream.append(&ClickEvent::single("abc")).await.unwrap();
        stream
            .append(&ClickEvent {
                short_code: "def".to_string(),
                delta: 3,
            })
            .await
            .unwrap();

        let events = stream
            .drain("group", "c1", 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].delta, 3);

        // Entries were acked; nothing left to drain.
        let empty = stream
            .drain("group", "c1", 10, Duration::from_millis(1))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
