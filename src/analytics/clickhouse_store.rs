use anyhow::{Context, Result};
use async_trait::async_trait;
use clickhouse::Client;

use super::{ClickEventRow, ColumnarStore};
use crate::config::AnalyticsConfig;

const CLICK_EVENTS_DDL: &str = "
CREATE TABLE IF NOT EXISTS click_events (
    short_code String,
    delta UInt32,
    event_time DateTime
) ENGINE = MergeTree
ORDER BY (short_code, event_time)
";

pub struct ClickHouseStore {
    client: Client,
}

impl ClickHouseStore {
    pub fn new(config: &AnalyticsConfig) -> Self {
        let client = Client::default()
            .with_url(&config.clickhouse_url)
            .with_user(&config.clickhouse_username)
            .with_password(&config.clickhouse_password)
            .with_database(&config.clickhouse_database);
        Self { client }
    }
}

#[async_trait]
impl ColumnarStore for ClickHouseStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.client
            .query(CLICK_EVENTS_DDL)
            .execute()
            .await
            .context("failed to apply click_events ddl")
    }

    async fn insert_clicks(&self, rows: &[ClickEventRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut insert = self
            .client
            .insert("click_events")
            .context("failed to open click_events insert")?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await.context("failed to commit click_events insert")
    }
}
