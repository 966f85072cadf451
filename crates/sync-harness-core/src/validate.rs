//! Structural validation of cached batches.
//!
//! Run on every batch before it is persisted and again before it is handed
//! to the ingestion pipeline. Any failure is [`SyncError::CacheCorruption`].

use std::collections::HashSet;

use crate::error::SyncError;
use crate::models::CacheBatch;

pub fn validate_batch(batch_ref: &str, batch: &CacheBatch) -> Result<(), SyncError> {
    let corrupt = |detail: String| SyncError::CacheCorruption {
        batch: batch_ref.to_string(),
        detail,
    };

    let mut seen = HashSet::with_capacity(batch.records.len());
    for record in &batch.records {
        if record.source_type != batch.source_type {
            return Err(corrupt(format!(
                "record {} has source_type {} in a {} batch",
                record.source_id, record.source_type, batch.source_type
            )));
        }
        if record.source_id.trim().is_empty() {
            return Err(corrupt("record with empty source_id".to_string()));
        }
        if !seen.insert(record.source_id.as_str()) {
            return Err(corrupt(format!(
                "duplicate source_id {}",
                record.source_id
            )));
        }
        if !record.access_descriptor.is_well_formed() {
            return Err(corrupt(format!(
                "record {} is restricted but grants no scope, principal, or owner",
                record.source_id
            )));
        }
    }
    Ok(())
}
