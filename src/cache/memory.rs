//! In-process cache backend with the same semantics as the Redis backend.
//!
//! Used by the test suite and by single-node local runs where no Redis is
//! available. Expiry is evaluated lazily on access.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::backend::{CacheBackend, StreamEntry};

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: HashSet<String>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, StringEntry>,
    hashes: HashMap<String, HashMap<String, String>>,
    streams: HashMap<String, StreamState>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<String> {
        match self.strings.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                self.strings.remove(key);
                None
            }
            None => None,
        }
    }

    fn counter_add(&mut self, key: &str, delta: i64) -> Result<i64> {
        let current = match self.live_value(key) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| anyhow!("value at '{key}' is not an integer"))?,
            None => 0,
        };
        let next = current + delta;
        let expires_at = self.strings.get(key).and_then(|e| e.expires_at);
        self.strings.insert(
            key.to_string(),
            StringEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }
}

pub struct MemoryBackend {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            failing: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every subsequent operation errors until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(anyhow!("memory cache backend marked unavailable"))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.inner.lock().await.live_value(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.lock().await.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.inner.lock().await.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner.strings.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn del_if_equals(&self, key: &str, token: &str) -> Result<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if inner.live_value(key).as_deref() == Some(token) {
            inner.strings.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.check()?;
        self.inner.lock().await.counter_add(key, delta)
    }

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.check()?;
        self.inner.lock().await.counter_add(key, -delta)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if inner.live_value(key).is_none() {
            return Ok(false);
        }
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner
            .lock()
            .await
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let current = hash
            .get(field)
            .map(|v| v.parse::<i64>())
            .transpose()
            .map_err(|_| anyhow!("hash field '{field}' is not an integer"))?
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .await
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn xadd(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.next_seq += 1;
        let id = format!("0-{}", state.next_seq);
        state.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        Ok(id)
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        _block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let group_state = state.groups.entry(group.to_string()).or_default();

        let start = group_state.cursor;
        let end = (start + count).min(state.entries.len());
        let delivered: Vec<StreamEntry> = state.entries[start..end].to_vec();
        group_state.cursor = end;
        for entry in &delivered {
            group_state.pending.insert(entry.id.clone());
        }
        Ok(delivered)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn dbsize(&self) -> Result<i64> {
        self.check()?;
        let inner = self.inner.lock().await;
        let live_strings = inner.strings.values().filter(|e| e.live()).count();
        Ok((live_strings + inner.hashes.len() + inner.streams.len()) as i64)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut inner = self.inner.lock().await;

        let candidates: Vec<String> = inner.strings.keys().cloned().collect();
        let mut keys = Vec::new();
        for key in candidates {
            if matches_pattern(pattern, &key) && inner.live_value(&key).is_some() {
                keys.push(key);
            }
        }
        keys.extend(
            inner
                .hashes
                .keys()
                .filter(|key| matches_pattern(pattern, key))
                .cloned(),
        );
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Prefix globs only (`prefix*`); anything else is an exact match. That is
/// the only pattern shape the system scans with.
fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}
