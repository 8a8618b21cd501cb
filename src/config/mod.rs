use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    /// Base URL advertised in `short_url` fields of API responses.
    pub base_url: String,
    pub cache: CacheConfig,
    pub allocator: AllocatorConfig,
    pub clicks: ClickConfig,
    pub queue: QueueConfig,
    pub ingestion: IngestionConfig,
    pub analytics: AnalyticsConfig,
    pub warmer: WarmerConfig,
    /// Minimum padded width of allocator-generated short codes.
    #[serde(default = "Config::default_short_code_length")]
    pub short_code_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    #[serde(default = "DatabaseConfig::default_max_connections")]
    pub max_connections: u32,
}

impl DatabaseConfig {
    const fn default_max_connections() -> u32 {
        30
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Primary (write) Redis endpoint. Ignored when sentinels are configured.
    pub url: String,
    /// Read replica endpoint; reads fall back to the primary when unset.
    pub replica_url: Option<String>,
    /// Comma-separated `host:port` sentinel endpoints. When set, master and
    /// replica addresses are resolved through the sentinels instead of the
    /// URLs above.
    pub sentinel_hosts: Option<String>,
    #[serde(default = "CacheConfig::default_sentinel_master_name")]
    pub sentinel_master_name: String,
    /// TTL of the `url:<code>` lookup payload.
    #[serde(default = "CacheConfig::default_url_ttl_secs")]
    pub url_ttl_secs: u64,
    /// Single-flight lock behavior for lookup-cache misses.
    #[serde(default = "CacheConfig::default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "CacheConfig::default_lock_retry_count")]
    pub lock_retry_count: u32,
    #[serde(default = "CacheConfig::default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
}

impl CacheConfig {
    fn default_sentinel_master_name() -> String {
        "mymaster".to_string()
    }

    const fn default_url_ttl_secs() -> u64 {
        3600
    }

    const fn default_lock_ttl_secs() -> u64 {
        3
    }

    const fn default_lock_retry_count() -> u32 {
        3
    }

    const fn default_lock_retry_delay_ms() -> u64 {
        50
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Dedicated primary counter backend. Falls back to the cache primary
    /// when unset.
    pub primary_redis_url: Option<String>,
    /// Optional secondary counter backend tried before the OLTP fallback.
    pub secondary_redis_url: Option<String>,
    #[serde(default = "AllocatorConfig::default_block_size")]
    pub block_size: i64,
    /// Counter and sequence base. Large enough to clear legacy id space.
    #[serde(default = "AllocatorConfig::default_base")]
    pub base: i64,
    #[serde(default = "AllocatorConfig::default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "AllocatorConfig::default_lock_retries")]
    pub lock_retries: u32,
}

impl AllocatorConfig {
    const fn default_block_size() -> i64 {
        1000
    }

    const fn default_base() -> i64 {
        1_000_000
    }

    const fn default_lock_ttl_secs() -> u64 {
        10
    }

    const fn default_lock_retries() -> u32 {
        5
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickConfig {
    #[serde(default = "ClickConfig::default_buffer_ttl_secs")]
    pub buffer_ttl_secs: u64,
    /// Buffered count at which the request path attempts an opportunistic
    /// flush under `lock:click_flush:<code>`.
    #[serde(default = "ClickConfig::default_flush_threshold")]
    pub flush_threshold: i64,
    #[serde(default = "ClickConfig::default_stream_key")]
    pub stream_key: String,
}

impl ClickConfig {
    const fn default_buffer_ttl_secs() -> u64 {
        300
    }

    const fn default_flush_threshold() -> i64 {
        100
    }

    fn default_stream_key() -> String {
        "click_events".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub bootstrap_servers: String,
    #[serde(default = "QueueConfig::default_click_topic")]
    pub click_topic: String,
}

impl QueueConfig {
    fn default_click_topic() -> String {
        "click_events".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "IngestionConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "IngestionConfig::default_block_ms")]
    pub block_ms: u64,
    #[serde(default = "IngestionConfig::default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "IngestionConfig::default_consumer_group")]
    pub consumer_group: String,
    /// Stable per-instance name; also keys the `ingestion_agg:<name>` spill
    /// hash. Generated when unset.
    pub consumer_name: Option<String>,
}

impl IngestionConfig {
    const fn default_batch_size() -> usize {
        500
    }

    const fn default_block_ms() -> u64 {
        1000
    }

    const fn default_flush_interval_secs() -> u64 {
        5
    }

    fn default_consumer_group() -> String {
        "click_ingestion_group".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    pub clickhouse_url: String,
    pub clickhouse_username: String,
    pub clickhouse_password: String,
    pub clickhouse_database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmerConfig {
    #[serde(default = "WarmerConfig::default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "WarmerConfig::default_top_n")]
    pub top_n: i64,
    /// Share of each tick spent on newest records instead of top-clicked.
    #[serde(default = "WarmerConfig::default_newest_share")]
    pub newest_share: f64,
    /// Share of each tick spent on codes with high click-buffer activity
    /// (real-time hot content not yet reflected in persisted clicks).
    #[serde(default = "WarmerConfig::default_buffer_share")]
    pub buffer_share: f64,
    /// Allocate this many IDs per tick to prime allocator blocks.
    #[serde(default)]
    pub pregenerate: i64,
    /// Additionally warm this many random records per tick.
    #[serde(default)]
    pub random_sample: i64,
    /// Keep warming random records until the cache holds at least this many
    /// keys. Disabled at 0.
    #[serde(default)]
    pub target_keys: i64,
    /// Run an extra warm cycle when the sampled lookup hit rate (percent)
    /// drops below this value. Disabled at 0.
    #[serde(default)]
    pub hit_rate_threshold: f64,
}

impl WarmerConfig {
    const fn default_interval_secs() -> u64 {
        30
    }

    const fn default_top_n() -> i64 {
        5000
    }

    const fn default_newest_share() -> f64 {
        0.3
    }

    const fn default_buffer_share() -> f64 {
        0.2
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_trimmed(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    const fn default_short_code_length() -> usize {
        8
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend_str =
            std::env::var("DATABASE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());
        let backend = match backend_str.to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            _ => DatabaseBackend::Sqlite,
        };

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://./zipline.db".to_string());

        let api_host = std::env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let api_port = std::env::var("API_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()?;

        let base_url = env_trimmed("BASE_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{}:{}", api_host, api_port));

        let cache = CacheConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string()),
            replica_url: env_trimmed("REDIS_REPLICA_URL"),
            sentinel_hosts: env_trimmed("REDIS_SENTINEL_HOSTS"),
            sentinel_master_name: env_trimmed("REDIS_SENTINEL_MASTER_NAME")
                .unwrap_or_else(CacheConfig::default_sentinel_master_name),
            url_ttl_secs: env_parsed("CACHE_URL_TTL_SECONDS")
                .unwrap_or_else(CacheConfig::default_url_ttl_secs),
            lock_ttl_secs: env_parsed("CACHE_LOCK_TTL_SECONDS")
                .unwrap_or_else(CacheConfig::default_lock_ttl_secs),
            lock_retry_count: env_parsed("CACHE_LOCK_RETRY_COUNT")
                .unwrap_or_else(CacheConfig::default_lock_retry_count),
            lock_retry_delay_ms: env_parsed("CACHE_LOCK_RETRY_DELAY_MS")
                .unwrap_or_else(CacheConfig::default_lock_retry_delay_ms),
        };

        let allocator = AllocatorConfig {
            primary_redis_url: env_trimmed("KEYGEN_PRIMARY_REDIS_URL"),
            secondary_redis_url: env_trimmed("KEYGEN_SECONDARY_REDIS_URL"),
            block_size: env_parsed("ID_BLOCK_SIZE")
                .unwrap_or_else(AllocatorConfig::default_block_size),
            base: env_parsed("ID_ALLOCATOR_BASE").unwrap_or_else(AllocatorConfig::default_base),
            lock_ttl_secs: env_parsed("ID_LOCK_TTL_SECONDS")
                .unwrap_or_else(AllocatorConfig::default_lock_ttl_secs),
            lock_retries: env_parsed("ID_LOCK_RETRIES")
                .unwrap_or_else(AllocatorConfig::default_lock_retries),
        };

        let clicks = ClickConfig {
            buffer_ttl_secs: env_parsed("CLICK_BUFFER_TTL_SECONDS")
                .unwrap_or_else(ClickConfig::default_buffer_ttl_secs),
            flush_threshold: env_parsed("CLICK_FLUSH_THRESHOLD")
                .unwrap_or_else(ClickConfig::default_flush_threshold),
            stream_key: env_trimmed("CLICK_STREAM_KEY")
                .unwrap_or_else(ClickConfig::default_stream_key),
        };

        let queue = QueueConfig {
            bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            click_topic: env_trimmed("KAFKA_CLICK_TOPIC")
                .unwrap_or_else(QueueConfig::default_click_topic),
        };

        let ingestion = IngestionConfig {
            batch_size: env_parsed("INGESTION_BATCH_SIZE")
                .unwrap_or_else(IngestionConfig::default_batch_size),
            block_ms: env_parsed("INGESTION_BLOCK_MS")
                .unwrap_or_else(IngestionConfig::default_block_ms),
            flush_interval_secs: env_parsed("INGESTION_FLUSH_INTERVAL_SECONDS")
                .unwrap_or_else(IngestionConfig::default_flush_interval_secs),
            consumer_group: env_trimmed("INGESTION_CONSUMER_GROUP")
                .unwrap_or_else(IngestionConfig::default_consumer_group),
            consumer_name: env_trimmed("INGESTION_CONSUMER_NAME"),
        };

        let analytics = AnalyticsConfig {
            clickhouse_url: std::env::var("CLICKHOUSE_URL")
                .unwrap_or_else(|_| "http://localhost:8123".to_string()),
            clickhouse_username: std::env::var("CLICKHOUSE_USERNAME")
                .unwrap_or_else(|_| "default".to_string()),
            clickhouse_password: std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            clickhouse_database: std::env::var("CLICKHOUSE_DATABASE")
                .unwrap_or_else(|_| "default".to_string()),
        };

        let warmer = WarmerConfig {
            interval_secs: env_parsed("CACHE_WARMER_INTERVAL_SECONDS")
                .unwrap_or_else(WarmerConfig::default_interval_secs),
            top_n: env_parsed("CACHE_WARMER_TOP_N").unwrap_or_else(WarmerConfig::default_top_n),
            newest_share: env_parsed("CACHE_WARMER_NEWEST_SHARE")
                .unwrap_or_else(WarmerConfig::default_newest_share),
            buffer_share: env_parsed("CACHE_WARMER_BUFFER_SHARE")
                .unwrap_or_else(WarmerConfig::default_buffer_share),
            pregenerate: env_parsed("CACHE_WARMER_PREGENERATE").unwrap_or(0),
            random_sample: env_parsed("CACHE_WARMER_RANDOM_SAMPLE").unwrap_or(0),
            target_keys: env_parsed("CACHE_WARMER_TARGET_KEYS").unwrap_or(0),
            hit_rate_threshold: env_parsed("CACHE_WARMER_HIT_RATE_THRESHOLD").unwrap_or(0.0),
        };

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections: env_parsed("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(DatabaseConfig::default_max_connections),
            },
            server: ServerConfig {
                host: api_host,
                port: api_port,
            },
            base_url,
            cache,
            allocator,
            clicks,
            queue,
            ingestion,
            analytics,
            warmer,
            short_code_length: env_parsed("SHORT_CODE_LENGTH")
                .unwrap_or_else(Config::default_short_code_length),
        })
    }
}
