//! Resumable fetch cache.
//!
//! Every partition fetch is written here before anything downstream reads
//! it. A partition with a `pending` batch counts as already fetched, which
//! is how a retried cycle resumes instead of re-fetching. Batches become
//! `ingested` once their cycle commits and are removed by the retention
//! sweep; batches that fail validation are `quarantined` and kept for
//! review.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{error, info};
use uuid::Uuid;

use sync_harness_core::error::SyncError;
use sync_harness_core::models::{BatchStatus, CacheBatch, SourceRecord, SourceType};
use sync_harness_core::validate::validate_batch;

use crate::db::{from_millis, to_millis};

/// A batch as loaded from the cache, with its store-assigned id.
#[derive(Debug, Clone)]
pub struct StoredBatch {
    pub batch_id: String,
    pub batch: CacheBatch,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchCounts {
    pub pending: i64,
    pub ingested: i64,
    pub quarantined: i64,
}

#[derive(Clone)]
pub struct FetchCache {
    pool: SqlitePool,
}

fn batch_ref(batch: &CacheBatch) -> String {
    format!(
        "{}/{}@{}",
        batch.source_type,
        batch.partition_key,
        batch.fetched_at.timestamp_millis()
    )
}

impl FetchCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a freshly fetched batch and return its id.
    ///
    /// A batch that fails validation is stored as `quarantined` and the call
    /// returns [`SyncError::CacheCorruption`]. A batch colliding with an
    /// existing one on source, partition and fetch time is an error; the
    /// stored batch is left untouched.
    pub async fn put(&self, batch: &CacheBatch) -> Result<String> {
        let validation = validate_batch(&batch_ref(batch), batch);
        let (status, reason) = match &validation {
            Ok(()) => (BatchStatus::Pending, None),
            Err(e) => (BatchStatus::Quarantined, Some(e.to_string())),
        };

        let payload = serde_json::to_string(&batch.records)?;
        let batch_id = Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            r#"
            INSERT INTO cache_batches (batch_id, source_type, partition_key, fetched_at, record_count,
                payload_json, status, quarantine_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_type, partition_key, fetched_at) DO NOTHING
            "#,
        )
        .bind(&batch_id)
        .bind(batch.source_type.as_str())
        .bind(&batch.partition_key)
        .bind(to_millis(batch.fetched_at))
        .bind(batch.records.len() as i64)
        .bind(&payload)
        .bind(status.as_str())
        .bind(&reason)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing cache batch {}", batch_ref(batch)))?
        .rows_affected();

        if inserted == 0 {
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT batch_id FROM cache_batches WHERE source_type = ? AND partition_key = ? AND fetched_at = ?",
            )
            .bind(batch.source_type.as_str())
            .bind(&batch.partition_key)
            .bind(to_millis(batch.fetched_at))
            .fetch_optional(&self.pool)
            .await?;
            bail!(
                "cache batch {} already exists as {}; refusing to drop {} fetched records",
                batch_ref(batch),
                existing.as_deref().unwrap_or("<unknown>"),
                batch.records.len()
            );
        }

        if let Err(e) = validation {
            error!(
                source_type = %batch.source_type,
                partition = %batch.partition_key,
                batch_id = %batch_id,
                error = %e,
                "Quarantined batch at write"
            );
            return Err(e.into());
        }
        Ok(batch_id)
    }

    /// Whether `partition_key` already has a batch waiting for ingestion.
    pub async fn already_fetched(&self, source_type: SourceType, partition_key: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM cache_batches WHERE source_type = ? AND partition_key = ? AND status = 'pending'",
        )
        .bind(source_type.as_str())
        .bind(partition_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Load every pending batch for `source_type`, oldest first.
    ///
    /// Each batch is re-validated; the first corrupt batch is quarantined
    /// and fails the whole load.
    pub async fn load_all(&self, source_type: SourceType) -> Result<Vec<StoredBatch>> {
        let rows = sqlx::query(
            r#"
            SELECT batch_id, partition_key, fetched_at, payload_json
            FROM cache_batches
            WHERE source_type = ? AND status = 'pending'
            ORDER BY fetched_at, partition_key
            "#,
        )
        .bind(source_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut batches = Vec::with_capacity(rows.len());
        for row in rows {
            let batch_id: String = row.get("batch_id");
            let payload: String = row.get("payload_json");

            let records: Vec<SourceRecord> = match serde_json::from_str(&payload) {
                Ok(r) => r,
                Err(e) => {
                    let err = SyncError::CacheCorruption {
                        batch: batch_id.clone(),
                        detail: format!("unreadable payload: {e}"),
                    };
                    self.quarantine(&batch_id, &err.to_string()).await?;
                    return Err(err.into());
                }
            };

            let batch = CacheBatch {
                source_type,
                partition_key: row.get("partition_key"),
                records,
                fetched_at: from_millis(row.get("fetched_at"))?,
            };

            if let Err(e) = validate_batch(&batch_id, &batch) {
                self.quarantine(&batch_id, &e.to_string()).await?;
                return Err(e.into());
            }
            batches.push(StoredBatch { batch_id, batch });
        }
        Ok(batches)
    }

    /// Archive batches whose cycle committed.
    pub async fn mark_ingested(&self, batch_ids: &[String], cycle_id: &str) -> Result<()> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;
        for id in batch_ids {
            sqlx::query(
                "UPDATE cache_batches SET status = 'ingested', cycle_id = ?, ingested_at = ? WHERE batch_id = ? AND status = 'pending'",
            )
            .bind(cycle_id)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn quarantine(&self, batch_id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            "UPDATE cache_batches SET status = 'quarantined', quarantine_reason = ? WHERE batch_id = ?",
        )
        .bind(reason)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        error!(batch_id, reason, "Quarantined cache batch");
        Ok(())
    }

    /// Delete ingested batches outside the `keep_cycles` most recent cycles.
    ///
    /// Pending and quarantined batches are never swept.
    pub async fn sweep(&self, source_type: Option<SourceType>, keep_cycles: usize) -> Result<u64> {
        let targets: Vec<String> = match source_type {
            Some(st) => vec![st.as_str().to_string()],
            None => {
                sqlx::query_scalar("SELECT DISTINCT source_type FROM cache_batches WHERE status = 'ingested'")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut deleted = 0u64;
        for st in targets {
            let result = sqlx::query(
                r#"
                DELETE FROM cache_batches
                WHERE source_type = ? AND status = 'ingested'
                  AND cycle_id NOT IN (
                    SELECT cycle_id FROM cache_batches
                    WHERE source_type = ? AND status = 'ingested'
                    GROUP BY cycle_id
                    ORDER BY MAX(ingested_at) DESC
                    LIMIT ?
                  )
                "#,
            )
            .bind(&st)
            .bind(&st)
            .bind(keep_cycles as i64)
            .execute(&self.pool)
            .await?;
            deleted += result.rows_affected();
        }

        info!(deleted, keep_cycles, "Cache retention sweep finished");
        Ok(deleted)
    }

    /// Batch counts by status for one source.
    pub async fn counts(&self, source_type: SourceType) -> Result<BatchCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM cache_batches WHERE source_type = ? GROUP BY status",
        )
        .bind(source_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BatchCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.parse::<BatchStatus>()? {
                BatchStatus::Pending => counts.pending = n,
                BatchStatus::Ingested => counts.ingested = n,
                BatchStatus::Quarantined => counts.quarantined = n,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use sync_harness_core::error::{classify, ErrorClass};
    use sync_harness_core::models::{AccessDescriptor, Attributes};

    async fn cache() -> (FetchCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::parse_config(&format!(
            "[db]\npath = \"{}\"\n",
            dir.path().join("cache.sqlite").display()
        ))
        .unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        (FetchCache::new(pool), dir)
    }

    fn record(id: &str) -> SourceRecord {
        SourceRecord {
            source_id: id.to_string(),
            source_type: SourceType::Meetings,
            content_text: format!("transcript {id}"),
            updated_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            access_descriptor: AccessDescriptor::scoped("team"),
            attributes: Attributes::new(),
        }
    }

    fn batch(partition: &str, ids: &[&str], offset_secs: i64) -> CacheBatch {
        CacheBatch {
            source_type: SourceType::Meetings,
            partition_key: partition.to_string(),
            records: ids.iter().map(|id| record(id)).collect(),
            fetched_at: DateTime::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn put_then_resume_then_ingest() {
        let (cache, _dir) = cache().await;
        let id = cache.put(&batch("standup", &["m1", "m2"], 0)).await.unwrap();

        assert!(cache.already_fetched(SourceType::Meetings, "standup").await.unwrap());
        assert!(!cache.already_fetched(SourceType::Meetings, "retro").await.unwrap());

        let loaded = cache.load_all(SourceType::Meetings).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].batch_id, id);
        assert_eq!(loaded[0].batch.records.len(), 2);

        cache.mark_ingested(&[id], "cycle-1").await.unwrap();
        assert!(!cache.already_fetched(SourceType::Meetings, "standup").await.unwrap());
        assert!(cache.load_all(SourceType::Meetings).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_ids_are_quarantined_on_write() {
        let (cache, _dir) = cache().await;
        let err = cache
            .put(&batch("standup", &["m1", "m1"], 0))
            .await
            .unwrap_err();
        assert_eq!(classify(&err), ErrorClass::CacheCorruption);

        let counts = cache.counts(SourceType::Meetings).await.unwrap();
        assert_eq!(counts.quarantined, 1);
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn colliding_batch_is_rejected_not_dropped() {
        let (cache, _dir) = cache().await;
        let first = cache.put(&batch("standup", &["m1"], 0)).await.unwrap();

        let err = cache
            .put(&batch("standup", &["m2", "m3"], 0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&first));

        let loaded = cache.load_all(SourceType::Meetings).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].batch_id, first);
        assert_eq!(cache.counts(SourceType::Meetings).await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn sweep_keeps_recent_cycles() {
        let (cache, _dir) = cache().await;
        for cycle in 0..4i64 {
            let id = cache
                .put(&batch("standup", &["m1"], cycle * 60))
                .await
                .unwrap();
            cache
                .mark_ingested(&[id], &format!("cycle-{cycle}"))
                .await
                .unwrap();
            // ingested_at ordering needs distinct timestamps
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let deleted = cache.sweep(Some(SourceType::Meetings), 2).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(cache.counts(SourceType::Meetings).await.unwrap().ingested, 2);
    }
}
