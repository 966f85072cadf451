//! Embedding and upsert pipeline.
//!
//! Turns cached batches into index entries and writes them, one upsert call
//! per batch. After every upsert the reported write count is compared with
//! the number of entries sent, and a deterministic sample of ids is read
//! back and compared with what was written; any mismatch is a
//! [`SyncError::PersistenceVerificationFailed`].
//!
//! Records whose stored entry already has the same content hash, or a newer
//! `updated_at`, are skipped without being embedded.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use sync_harness_core::embedding::{embed_all, Embedder};
use sync_harness_core::error::SyncError;
use sync_harness_core::index::{IndexNamespace, SearchIndex};
use sync_harness_core::metadata::{build_metadata, MetadataBudget};
use sync_harness_core::models::{IndexEntry, SourceRecord};
use sync_harness_core::terms::sparse_terms;

use crate::fetch_cache::StoredBatch;

/// A failure attributed to one batch, or to one record within it.
#[derive(Debug, Clone)]
pub struct IngestError {
    pub batch_id: String,
    pub partition_key: String,
    pub source_id: Option<String>,
    pub error: SyncError,
}

#[derive(Debug, Clone, Default)]
pub struct IngestResult {
    /// Records considered across all batches.
    pub attempted: usize,
    /// Entries the index confirmed writing.
    pub upserted: usize,
    /// Unchanged or stale records that were not rewritten.
    pub skipped: usize,
    pub errors: Vec<IngestError>,
}

impl IngestResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct IngestPipeline {
    index: Arc<dyn SearchIndex>,
    embedder: Arc<dyn Embedder>,
    namespace: IndexNamespace,
    budget: MetadataBudget,
    verify_min_sample: usize,
}

/// Reuse a `SyncError` found in the chain, or wrap the error as `fallback`.
fn to_sync_error(err: &anyhow::Error, fallback: fn(String) -> SyncError) -> SyncError {
    err.chain()
        .find_map(|e| e.downcast_ref::<SyncError>())
        .cloned()
        .unwrap_or_else(|| fallback(format!("{err:#}")))
}

/// Number of ids read back after writing `n` entries.
pub fn sample_size(n: usize, min_sample: usize) -> usize {
    let root = (n as f64).sqrt().ceil() as usize;
    n.min(min_sample.max(root))
}

/// Evenly strided sample of `ids`.
fn stride_sample(ids: &[String], size: usize) -> Vec<String> {
    if size == 0 || ids.is_empty() {
        return Vec::new();
    }
    (0..size).map(|i| ids[i * ids.len() / size].clone()).collect()
}

impl IngestPipeline {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
        namespace: IndexNamespace,
        budget: MetadataBudget,
        verify_min_sample: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            namespace,
            budget,
            verify_min_sample,
        }
    }

    pub fn namespace(&self) -> &IndexNamespace {
        &self.namespace
    }

    /// Ingest every batch. Failures are collected, not raised, so the
    /// caller sees the full picture before deciding not to commit.
    pub async fn ingest(&self, batches: &[StoredBatch]) -> IngestResult {
        let mut result = IngestResult::default();
        for stored in batches {
            self.ingest_batch(stored, &mut result).await;
        }
        info!(
            namespace = %self.namespace,
            batches = batches.len(),
            attempted = result.attempted,
            upserted = result.upserted,
            skipped = result.skipped,
            errors = result.errors.len(),
            "Ingest finished"
        );
        result
    }

    async fn ingest_batch(&self, stored: &StoredBatch, result: &mut IngestResult) {
        let batch = &stored.batch;
        let fail = |source_id: Option<String>, error: SyncError| IngestError {
            batch_id: stored.batch_id.clone(),
            partition_key: batch.partition_key.clone(),
            source_id,
            error,
        };

        result.attempted += batch.records.len();
        if batch.records.is_empty() {
            return;
        }

        let changed = match self.changed_records(&batch.records).await {
            Ok(c) => c,
            Err(e) => {
                result.errors.push(fail(None, to_sync_error(&e, SyncError::IndexWrite)));
                return;
            }
        };
        result.skipped += batch.records.len() - changed.len();
        if changed.is_empty() {
            debug!(batch_id = %stored.batch_id, "Batch unchanged, nothing to write");
            return;
        }

        let mut prepared = Vec::with_capacity(changed.len());
        for record in changed {
            let id = record.entry_id();
            match build_metadata(&id, record, self.budget) {
                Ok(meta) => prepared.push((id, record, meta)),
                Err(e) => {
                    error!(
                        batch_id = %stored.batch_id,
                        source_id = %record.source_id,
                        error = %e,
                        "Record metadata cannot fit the budget"
                    );
                    result.errors.push(fail(Some(record.source_id.clone()), e));
                }
            }
        }
        if prepared.is_empty() {
            return;
        }

        let texts: Vec<String> = prepared.iter().map(|(_, _, m)| m.content.clone()).collect();
        let vectors = match embed_all(self.embedder.as_ref(), &texts).await {
            Ok(v) => v,
            Err(e) => {
                warn!(batch_id = %stored.batch_id, error = %format!("{e:#}"), "Embedding failed");
                result
                    .errors
                    .push(fail(None, to_sync_error(&e, SyncError::UpstreamTransient)));
                return;
            }
        };

        let entries: Vec<IndexEntry> = prepared
            .into_iter()
            .zip(vectors)
            .map(|((id, record, meta), vector)| IndexEntry {
                id,
                source_type: record.source_type,
                source_id: record.source_id.clone(),
                sparse_terms: sparse_terms(&meta.content),
                content: meta.content,
                content_hash: record.content_hash(),
                updated_at: record.updated_at,
                embedding_vector: vector,
                metadata_json: meta.json,
                access_descriptor: record.access_descriptor.clone(),
            })
            .collect();

        match self.write_verified(&entries).await {
            Ok(written) => {
                result.upserted += written;
                debug!(
                    batch_id = %stored.batch_id,
                    partition = %batch.partition_key,
                    written,
                    "Batch upserted and verified"
                );
            }
            Err(e) => {
                error!(
                    batch_id = %stored.batch_id,
                    partition = %batch.partition_key,
                    error = %e,
                    "Batch write failed verification"
                );
                result.errors.push(fail(None, e));
            }
        }
    }

    /// Records that are new, or newer than what the index holds.
    async fn changed_records<'a>(&self, records: &'a [SourceRecord]) -> Result<Vec<&'a SourceRecord>> {
        let ids: Vec<String> = records.iter().map(SourceRecord::entry_id).collect();
        let stored = self.index.fingerprints(&self.namespace, &ids).await?;
        Ok(records
            .iter()
            .zip(&ids)
            .filter(|(record, id)| match stored.get(*id) {
                None => true,
                Some(fp) => fp.content_hash != record.content_hash() && fp.updated_at <= record.updated_at,
            })
            .map(|(record, _)| record)
            .collect())
    }

    /// One upsert call, then count check and sampled read-back.
    ///
    /// A sampled id must come back with the `content_hash` and `updated_at`
    /// just written; an older row under the same id counts as stale.
    async fn write_verified(&self, entries: &[IndexEntry]) -> Result<usize, SyncError> {
        let ack = self
            .index
            .upsert(&self.namespace, entries)
            .await
            .map_err(|e| to_sync_error(&e, SyncError::IndexWrite))?;

        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let sample = stride_sample(&ids, sample_size(ids.len(), self.verify_min_sample));
        let stored = self
            .index
            .fingerprints(&self.namespace, &sample)
            .await
            .map_err(|e| to_sync_error(&e, SyncError::IndexWrite))?;
        let written: HashMap<&str, &IndexEntry> =
            entries.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut missing = 0usize;
        let mut stale = 0usize;
        for id in &sample {
            match (stored.get(id), written.get(id.as_str())) {
                (None, _) => missing += 1,
                // Stores keep millisecond timestamps.
                (Some(fp), Some(entry))
                    if fp.content_hash != entry.content_hash
                        || fp.updated_at.timestamp_millis() != entry.updated_at.timestamp_millis() =>
                {
                    stale += 1
                }
                _ => {}
            }
        }

        if ack.written != entries.len() || missing > 0 || stale > 0 {
            return Err(SyncError::PersistenceVerificationFailed {
                attempted: entries.len(),
                reported: ack.written,
                sampled: sample.len(),
                missing,
                stale,
            });
        }
        Ok(ack.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_size_grows_with_sqrt() {
        assert_eq!(sample_size(0, 16), 0);
        assert_eq!(sample_size(5, 16), 5);
        assert_eq!(sample_size(100, 16), 16);
        assert_eq!(sample_size(500, 16), 23);
        assert_eq!(sample_size(10_000, 16), 100);
    }

    #[test]
    fn stride_sample_is_deterministic_and_spread() {
        let ids: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(stride_sample(&ids, 5), vec!["0", "2", "4", "6", "8"]);
        assert_eq!(stride_sample(&ids, 10), ids);
        assert!(stride_sample(&ids, 0).is_empty());
    }
}
