use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

use crate::models::UrlRecord;
use crate::storage::{AllocationRecord, StoreError, StoreResult, UrlStore};

pub struct PostgresStore {
    pool: Arc<PgPool>,
    /// Sequence start; kept above legacy id space.
    sequence_base: i64,
    /// Sequence step. Fallback ranges must not exceed it.
    sequence_increment: i64,
}

impl PostgresStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        sequence_base: i64,
        sequence_increment: i64,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
            sequence_base,
            sequence_increment: sequence_increment.max(1),
        })
    }

    async fn fetch(&self, short_code: &str) -> Result<Option<UrlRecord>> {
        let record = sqlx::query_as::<_, UrlRecord>(
            r#"
            SELECT id, short_code, original_url, clicks, created_at, updated_at
            FROM urls
            WHERE short_code = $1
            "#,
        )
        .bind(short_code)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(record)
    }
}

#[async_trait]
impl UrlStore for PostgresStore {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS urls (
                id BIGSERIAL PRIMARY KEY,
                short_code TEXT NOT NULL UNIQUE,
                original_url TEXT NOT NULL,
                clicks BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_urls_short_code ON urls(short_code)")
            .execute(self.pool.as_ref())
            .await?;

        // Warmer scan paths.
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_urls_clicks ON urls(clicks DESC)")
            .execute(self.pool.as_ref())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_urls_created_at ON urls(created_at DESC)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS id_allocation_records (
                id BIGSERIAL PRIMARY KEY,
                start_id BIGINT NOT NULL,
                end_id BIGINT NOT NULL,
                range_size BIGINT NOT NULL,
                allocated_at TIMESTAMPTZ NOT NULL,
                source TEXT NOT NULL,
                UNIQUE(start_id, end_id)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_id_allocation_records_range
             ON id_allocation_records(start_id, end_id)",
        )
        .execute(self.pool.as_ref())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_id_allocation_records_allocated_at
             ON id_allocation_records(allocated_at DESC)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(&format!(
            "CREATE SEQUENCE IF NOT EXISTS url_id_sequence START {} INCREMENT {}",
            self.sequence_base, self.sequence_increment
        ))
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn insert(
        &self,
        id: Option<i64>,
        short_code: &str,
        original_url: &str,
    ) -> StoreResult<UrlRecord> {
        let now = Utc::now();

        let result = match id {
            Some(id) => {
                sqlx::query(
                    r#"
                    INSERT INTO urls (id, short_code, original_url, clicks, created_at, updated_at)
                    VALUES ($1, $2, $3, 0, $4, $4)
                    ON CONFLICT (short_code) DO NOTHING
                    "#,
                )
                .bind(id)
                .bind(short_code)
                .bind(original_url)
                .bind(now)
                .execute(self.pool.as_ref())
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO urls (short_code, original_url, clicks, created_at, updated_at)
                    VALUES ($1, $2, 0, $3, $3)
                    ON CONFLICT (short_code) DO NOTHING
                    "#,
                )
                .bind(short_code)
                .bind(original_url)
                .bind(now)
                .execute(self.pool.as_ref())
                .await
            }
        }
        .map_err(|e| StoreError::Other(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }

        self.fetch(short_code)
            .await
            .map_err(StoreError::Other)?
            .ok_or_else(|| StoreError::Other(anyhow::anyhow!("inserted row vanished")))
    }

    async fn get(&self, short_code: &str) -> Result<Option<UrlRecord>> {
        self.fetch(short_code).await
    }

    async fn exists(&self, short_code: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM urls WHERE short_code = $1")
                .bind(short_code)
                .fetch_one(self.pool.as_ref())
                .await?;
        Ok(count > 0)
    }

    async fn add_clicks(&self, deltas: &[(String, i64)]) -> Result<()> {
        if deltas.iter().all(|(_, delta)| *delta <= 0) {
            return Ok(());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for (short_code, delta) in deltas {
            if *delta <= 0 {
                continue;
            }
            sqlx::query(
                r#"
                UPDATE urls
                SET clicks = clicks + $2, updated_at = $3
                WHERE short_code = $1
                "#,
            )
            .bind(short_code)
            .bind(delta)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn top_clicked(&self, limit: i64) -> Result<Vec<UrlRecord>> {
        let records = sqlx::query_as::<_, UrlRecord>(
            r#"
            SELECT id, short_code, original_url, clicks, created_at, updated_at
            FROM urls
            ORDER BY clicks DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(records)
    }

    async fn newest(&self, limit: i64) -> Result<Vec<UrlRecord>> {
        let records = sqlx::query_as::<_, UrlRecord>(
            r#"
            SELECT id, short_code, original_url, clicks, created_at, updated_at
            FROM urls
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(records)
    }

    async fn random_sample(&self, limit: i64) -> Result<Vec<UrlRecord>> {
        let records = sqlx::query_as::<_, UrlRecord>(
            r#"
            SELECT id, short_code, original_url, clicks, created_at, updated_at
            FROM urls
            ORDER BY random()
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(records)
    }

    async fn record_allocations(&self, records: &[AllocationRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO id_allocation_records
                    (start_id, end_id, range_size, allocated_at, source)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (start_id, end_id) DO NOTHING
                "#,
            )
            .bind(record.start_id)
            .bind(record.end_id)
            .bind(record.range_size)
            .bind(record.allocated_at)
            .bind(&record.source)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn max_allocated_end(&self) -> Result<Option<i64>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(end_id) FROM id_allocation_records")
                .fetch_one(self.pool.as_ref())
                .await?;
        Ok(max)
    }

    async fn next_id_range(&self, size: i64) -> Result<(i64, i64)> {
        let size = size.clamp(1, self.sequence_increment);
        let start: i64 = sqlx::query_scalar("SELECT nextval('url_id_sequence')")
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok((start, start + size - 1))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool.as_ref()).await?;
        Ok(())
    }
}
