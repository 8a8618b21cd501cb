use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;

use crate::models::UrlRecord;
use crate::storage::{AllocationRecord, StoreError, StoreResult, UrlStore};

/// SQLite-backed store for tests and single-node deployments. The allocator
/// sequence is emulated with a one-row counter table advanced under the
/// write lock, which gives the same disjoint-range guarantee as the
/// Postgres sequence.
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
    sequence_base: i64,
    sequence_increment: i64,
}

impl SqliteStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        Self::connect_with_sequence(database_url, max_connections, 1_000_000, 1000).await
    }

    pub async fn connect_with_sequence(
        database_url: &str,
        max_connections: u32,
        sequence_base: i64,
        sequence_increment: i64,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every pooled connection to `:memory:` would open its own empty
        // database; a single connection keeps one shared view.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
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
            WHERE short_code = ?1
            "#,
        )
        .bind(short_code)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(record)
    }
}

#[async_trait]
impl UrlStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS urls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                short_code TEXT NOT NULL UNIQUE,
                original_url TEXT NOT NULL,
                clicks INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_urls_short_code ON urls(short_code)")
            .execute(self.pool.as_ref())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_urls_clicks ON urls(clicks DESC)")
            .execute(self.pool.as_ref())
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_urls_created_at ON urls(created_at DESC)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS id_allocation_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                start_id INTEGER NOT NULL,
                end_id INTEGER NOT NULL,
                range_size INTEGER NOT NULL,
                allocated_at TEXT NOT NULL,
                source TEXT NOT NULL,
                UNIQUE(start_id, end_id)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_id_allocation_records_allocated_at
             ON id_allocation_records(allocated_at DESC)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS url_id_sequence (value INTEGER NOT NULL)")
            .execute(self.pool.as_ref())
            .await?;
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM url_id_sequence")
            .fetch_one(self.pool.as_ref())
            .await?;
        if rows == 0 {
            sqlx::query("INSERT INTO url_id_sequence (value) VALUES (?1)")
                .bind(self.sequence_base)
                .execute(self.pool.as_ref())
                .await?;
        }

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
                    VALUES (?1, ?2, ?3, 0, ?4, ?4)
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
                    VALUES (?1, ?2, 0, ?3, ?3)
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
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM urls WHERE short_code = ?1")
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
                SET clicks = clicks + ?2, updated_at = ?3
                WHERE short_code = ?1
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
            LIMIT ?1
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
            LIMIT ?1
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
            ORDER BY RANDOM()
            LIMIT ?1
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
                VALUES (?1, ?2, ?3, ?4, ?5)
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
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(end_id) FROM id_allocation_records")
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(max)
    }

    async fn next_id_range(&self, size: i64) -> Result<(i64, i64)> {
        let size = size.clamp(1, self.sequence_increment);
        let advanced: i64 =
            sqlx::query_scalar("UPDATE url_id_sequence SET value = value + ?1 RETURNING value")
                .bind(self.sequence_increment)
                .fetch_one(self.pool.as_ref())
                .await?;
        let start = advanced - self.sequence_increment;
        Ok((start, start + size - 1))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool.as_ref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        let store = SqliteStore::connect("sqlite::memory:", 5).await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let store = store().await;
        let record = store
            .insert(Some(1_000_001), "0000g8xP", "https://example.com")
            .await
            .unwrap();
        assert_eq!(record.id, 1_000_001);
        assert_eq!(record.clicks, 0);
        assert!(record.updated_at >= record.created_at);

        let fetched = store.get("0000g8xP").await.unwrap().unwrap();
        assert_eq!(fetched.original_url, "https://example.com");
    }

    #[tokio::test]
    async fn duplicate_short_code_is_conflict() {
        let store = store().await;
        store.insert(None, "taken1", "https://a").await.unwrap();
        let err = store.insert(None, "taken1", "https://b").await;
        assert!(matches!(err, Err(StoreError::Conflict)));
    }

    #[tokio::test]
    async fn add_clicks_is_additive_and_bumps_updated_at() {
        let store = store().await;
        let created = store.insert(None, "clicky", "https://a").await.unwrap();

        store
            .add_clicks(&[("clicky".to_string(), 5), ("missing".to_string(), 3)])
            .await
            .unwrap();
        store.add_clicks(&[("clicky".to_string(), 2)]).await.unwrap();

        let record = store.get("clicky").await.unwrap().unwrap();
        assert_eq!(record.clicks, 7);
        assert!(record.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn zero_deltas_are_a_no_op() {
        let store = store().await;
        store.insert(None, "idle", "https://a").await.unwrap();
        store.add_clicks(&[("idle".to_string(), 0)]).await.unwrap();
        assert_eq!(store.get("idle").await.unwrap().unwrap().clicks, 0);
    }

    #[tokio::test]
    async fn sequence_ranges_are_disjoint() {
        let store = store().await;
        let (s1, e1) = store.next_id_range(1000).await.unwrap();
        let (s2, e2) = store.next_id_range(10).await.unwrap();
        assert_eq!(s1, 1_000_000);
        assert_eq!(e1, 1_000_999);
        assert!(s2 > e1);
        assert_eq!(e2 - s2, 9);
    }

    #[tokio::test]
    async fn allocation_audit_is_idempotent() {
        let store = store().await;
        let record = AllocationRecord {
            start_id: 1_000_001,
            end_id: 1_001_000,
            range_size: 1000,
            allocated_at: Utc::now(),
            source: "primary_cache".to_string(),
        };
        store
            .record_allocations(&[record.clone(), record.clone()])
            .await
            .unwrap();
        store.record_allocations(&[record]).await.unwrap();
        assert_eq!(store.max_allocated_end().await.unwrap(), Some(1_001_000));
    }
}
