pub mod clickhouse_store;

pub use clickhouse_store::ClickHouseStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

/// One analytics row: an aggregated click delta for a code at flush time.
/// `event_time` is unix seconds (ClickHouse `DateTime`).
#[derive(Debug, Clone, Serialize, ::clickhouse::Row)]
pub struct ClickEventRow {
    pub short_code: String,
    pub delta: u32,
    pub event_time: u32,
}

#[async_trait]
pub trait ColumnarStore: Send + Sync {
    /// Apply the `click_events` DDL; safe to call repeatedly.
    async fn ensure_schema(&self) -> Result<()>;

    async fn insert_clicks(&self, rows: &[ClickEventRow]) -> Result<()>;
}

/// In-process columnar sink for tests and single-node runs.
#[derive(Default)]
pub struct MemoryColumnar {
    rows: Mutex<Vec<ClickEventRow>>,
}

impl MemoryColumnar {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<ClickEventRow> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl ColumnarStore for MemoryColumnar {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_clicks(&self, rows: &[ClickEventRow]) -> Result<()> {
        self.rows.lock().await.extend_from_slice(rows);
        Ok(())
    }
}
