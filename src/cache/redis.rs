//! Redis-backed cache client.
//!
//! One backend instance wraps one logical endpoint (master or replica)
//! behind a multiplexed [`ConnectionManager`]. Every operation is bounded
//! by a 5 s timeout and feeds a circuit breaker: five consecutive failures
//! open the circuit for 60 s, the first success closes it.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::backend::{CacheBackend, StreamEntry};

const OP_TIMEOUT: Duration = Duration::from_secs(5);
const BREAKER_MAX_FAILURES: u32 = 5;
const BREAKER_OPEN_SECS: u64 = 60;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Trips open after consecutive failures so a dead endpoint fails fast
/// instead of stacking up 5 s timeouts.
struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    open_until_ms: AtomicU64,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
        }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn check(&self) -> Result<()> {
        let open_until = self.open_until_ms.load(Ordering::Acquire);
        if open_until > Self::now_ms() {
            bail!("cache circuit breaker open");
        }
        Ok(())
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.open_until_ms.store(0, Ordering::Release);
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= BREAKER_MAX_FAILURES {
            self.open_until_ms
                .store(Self::now_ms() + BREAKER_OPEN_SECS * 1000, Ordering::Release);
        }
    }
}

pub struct RedisBackend {
    conn: ConnectionManager,
    breaker: CircuitBreaker,
    script: redis::Script,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url '{url}'"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("failed to connect to redis at '{url}'"))?;
        Ok(Self {
            conn,
            breaker: CircuitBreaker::new(),
            script: redis::Script::new(COMPARE_AND_DELETE),
        })
    }

    async fn exec<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T> {
        self.exec_with_timeout(cmd, OP_TIMEOUT).await
    }

    async fn exec_with_timeout<T: redis::FromRedisValue>(
        &self,
        cmd: redis::Cmd,
        timeout: Duration,
    ) -> Result<T> {
        self.breaker.check()?;
        let mut conn = self.conn.clone();
        match tokio::time::timeout(timeout, cmd.query_async::<T>(&mut conn)).await {
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                Err(err.into())
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(anyhow!("redis operation timed out"))
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.exec(cmd).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        self.exec::<()>(cmd).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl.as_secs().max(1));
        self.exec::<()>(cmd).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1));
        let reply: Option<String> = self.exec(cmd).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.exec::<i64>(cmd).await.map(|_| ())
    }

    async fn del_if_equals(&self, key: &str, token: &str) -> Result<bool> {
        self.breaker.check()?;
        let mut conn = self.conn.clone();
        let mut invocation = self.script.prepare_invoke();
        invocation.key(key).arg(token);
        match tokio::time::timeout(OP_TIMEOUT, invocation.invoke_async::<i64>(&mut conn)).await {
            Ok(Ok(deleted)) => {
                self.breaker.record_success();
                Ok(deleted > 0)
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                Err(err.into())
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(anyhow!("redis operation timed out"))
            }
        }
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(key).arg(delta);
        self.exec(cmd).await
    }

    async fn decr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut cmd = redis::cmd("DECRBY");
        cmd.arg(key).arg(delta);
        self.exec(cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl.as_secs().max(1));
        let set: i64 = self.exec(cmd).await?;
        Ok(set == 1)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        self.exec::<i64>(cmd).await.map(|_| ())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(key).arg(field).arg(delta);
        self.exec(cmd).await
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.exec(cmd).await
    }

    async fn xadd(&self, stream: &str, fields: &[(&str, &str)]) -> Result<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        self.exec(cmd).await
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg("0").arg("MKSTREAM");
        match self.exec::<String>(cmd).await {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">");

        // The op timeout must outlast the server-side block.
        let reply: Option<redis::streams::StreamReadReply> =
            self.exec_with_timeout(cmd, OP_TIMEOUT + block).await?;

        let mut entries = Vec::new();
        let Some(reply) = reply else {
            return Ok(entries);
        };
        for key in reply.keys {
            for id in key.ids {
                let fields = id
                    .map
                    .iter()
                    .map(|(field, value)| {
                        let text = redis::from_redis_value::<String>(value).unwrap_or_default();
                        (field.clone(), text)
                    })
                    .collect();
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group).arg(id);
        self.exec::<i64>(cmd).await.map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        self.exec::<String>(redis::cmd("PING")).await.map(|_| ())
    }

    async fn dbsize(&self) -> Result<i64> {
        self.exec(redis::cmd("DBSIZE")).await
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(500);
            let (next, batch): (u64, Vec<String>) = self.exec(cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Resolve master and replica endpoints through a sentinel quorum.
///
/// Each configured sentinel is tried in order; the first reachable one
/// answers `SENTINEL get-master-addr-by-name` and `SENTINEL replicas`.
pub async fn resolve_via_sentinel(
    sentinel_hosts: &str,
    master_name: &str,
) -> Result<(String, Option<String>)> {
    let mut last_error = anyhow!("no sentinel hosts configured");

    for host in sentinel_hosts.split(',').map(str::trim).filter(|h| !h.is_empty()) {
        let client = match redis::Client::open(format!("redis://{host}")) {
            Ok(client) => client,
            Err(err) => {
                last_error = err.into();
                continue;
            }
        };
        let mut conn = match tokio::time::timeout(
            OP_TIMEOUT,
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                last_error = err.into();
                continue;
            }
            Err(_) => {
                last_error = anyhow!("sentinel '{host}' timed out");
                continue;
            }
        };

        let master: Vec<String> = redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(master_name)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("sentinel '{host}' has no master '{master_name}'"))?;
        let (Some(ip), Some(port)) = (master.first(), master.get(1)) else {
            bail!("sentinel '{host}' returned malformed master address");
        };
        let master_url = format!("redis://{ip}:{port}");

        let replicas: Vec<Vec<String>> = redis::cmd("SENTINEL")
            .arg("replicas")
            .arg(master_name)
            .query_async(&mut conn)
            .await
            .unwrap_or_default();
        let replica_url = replicas.iter().find_map(|attrs| {
            let mut ip = None;
            let mut port = None;
            let mut flags = String::new();
            for pair in attrs.chunks(2) {
                match (pair.first().map(String::as_str), pair.get(1)) {
                    (Some("ip"), Some(v)) => ip = Some(v.clone()),
                    (Some("port"), Some(v)) => port = Some(v.clone()),
                    (Some("flags"), Some(v)) => flags = v.clone(),
                    _ => {}
                }
            }
            if flags.contains("s_down") || flags.contains("o_down") {
                return None;
            }
            Some(format!("redis://{}:{}", ip?, port?))
        });

        return Ok((master_url, replica_url));
    }

    Err(last_error.context("all sentinels unreachable"))
}
