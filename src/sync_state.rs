//! Durable per-source watermarks.
//!
//! `last_sync_at` only moves forward: the upsert keeps `MAX(old, new)`, so
//! a late or racing commit can never rewind a source.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::info;

use sync_harness_core::models::SourceType;

use crate::db::{from_millis, to_millis};

/// Partition key used for the per-source row.
const SOURCE_ROW: &str = "";

#[derive(Debug, Clone, Serialize)]
pub struct WatermarkRow {
    pub source_type: SourceType,
    pub last_sync_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SyncStateStore {
    pool: SqlitePool,
}

impl SyncStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stored watermark, without any default.
    pub async fn raw_watermark(&self, source_type: SourceType) -> Result<Option<DateTime<Utc>>> {
        let ms: Option<i64> = sqlx::query_scalar(
            "SELECT last_sync_at FROM sync_state WHERE source_type = ? AND partition_key = ?",
        )
        .bind(source_type.as_str())
        .bind(SOURCE_ROW)
        .fetch_optional(&self.pool)
        .await?;
        ms.map(from_millis).transpose()
    }

    /// Start of the next fetch window: the stored watermark, or
    /// `now - lookback` for a source that never committed.
    pub async fn get_watermark(
        &self,
        source_type: SourceType,
        lookback: Duration,
    ) -> Result<DateTime<Utc>> {
        Ok(self
            .raw_watermark(source_type)
            .await?
            .unwrap_or_else(|| Utc::now() - lookback))
    }

    /// Advance the watermark. Never moves it backward.
    pub async fn commit(&self, source_type: SourceType, ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let now = to_millis(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO sync_state (source_type, partition_key, last_sync_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source_type, partition_key) DO UPDATE SET
                last_sync_at = MAX(sync_state.last_sync_at, excluded.last_sync_at),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source_type.as_str())
        .bind(SOURCE_ROW)
        .bind(to_millis(ts))
        .bind(now)
        .execute(&self.pool)
        .await?;

        let stored = self.raw_watermark(source_type).await?.unwrap_or(ts);
        info!(source_type = %source_type, watermark = %stored, "Committed watermark");
        Ok(stored)
    }

    pub async fn all(&self) -> Result<Vec<WatermarkRow>> {
        let rows = sqlx::query(
            "SELECT source_type, last_sync_at, updated_at FROM sync_state WHERE partition_key = ? ORDER BY source_type",
        )
        .bind(SOURCE_ROW)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let st: String = row.get("source_type");
                Ok(WatermarkRow {
                    source_type: st.parse()?,
                    last_sync_at: from_millis(row.get("last_sync_at"))?,
                    updated_at: from_millis(row.get("updated_at"))?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (SyncStateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::parse_config(&format!(
            "[db]\npath = \"{}\"\n",
            dir.path().join("state.sqlite").display()
        ))
        .unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        (SyncStateStore::new(pool), dir)
    }

    #[tokio::test]
    async fn default_watermark_uses_lookback() {
        let (store, _dir) = store().await;
        assert!(store.raw_watermark(SourceType::Chat).await.unwrap().is_none());
        let wm = store
            .get_watermark(SourceType::Chat, Duration::hours(1))
            .await
            .unwrap();
        let age = Utc::now() - wm;
        assert!(age >= Duration::minutes(59) && age <= Duration::minutes(61));
    }

    #[tokio::test]
    async fn commit_is_monotonic() {
        let (store, _dir) = store().await;
        let t1 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let t0 = t1 - Duration::hours(2);
        let t2 = t1 + Duration::minutes(5);

        assert_eq!(store.commit(SourceType::Chat, t1).await.unwrap(), t1);
        assert_eq!(store.commit(SourceType::Chat, t0).await.unwrap(), t1);
        assert_eq!(store.commit(SourceType::Chat, t2).await.unwrap(), t2);
        assert_eq!(store.raw_watermark(SourceType::Chat).await.unwrap(), Some(t2));
        assert!(store.raw_watermark(SourceType::Documents).await.unwrap().is_none());
    }
}
