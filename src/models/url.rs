use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Canonical URL entity as persisted in the OLTP store.
///
/// `clicks` is the authoritative persisted count; it excludes deltas still
/// sitting in the cache-side click buffer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UrlRecord {
    pub id: i64,
    pub short_code: String,
    pub original_url: String,
    pub clicks: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Subset of [`UrlRecord`] cached under `url:<short_code>`. The fields are
/// identical; the alias marks intent at call sites that read or write the
/// cache payload.
pub type CachedUrlPayload = UrlRecord;

#[derive(Debug, Deserialize)]
pub struct CreateUrlRequest {
    pub url: String,
    pub custom_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UrlResponse {
    pub id: i64,
    pub short_code: String,
    pub original_url: String,
    pub short_url: String,
    pub clicks: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UrlResponse {
    pub fn from_record(record: &UrlRecord, base_url: &str) -> Self {
        Self {
            id: record.id,
            short_code: record.short_code.clone(),
            original_url: record.original_url.clone(),
            short_url: format!("{}/{}", base_url, record.short_code),
            clicks: record.clicks,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Queue payload for a click, keyed by `short_code` for partition affinity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickEvent {
    pub short_code: String,
    #[serde(default = "ClickEvent::default_delta")]
    pub delta: i64,
}

impl ClickEvent {
    pub fn single(short_code: &str) -> Self {
        Self {
            short_code: short_code.to_string(),
            delta: 1,
        }
    }

    const fn default_delta() -> i64 {
        1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub cache: HealthStatus,
}
