//! Search index abstraction.
//!
//! The [`SearchIndex`] trait covers everything the ingestion pipeline and
//! the hybrid query engine need from a backend: idempotent upsert by entry
//! id, read-back for write verification, and dense/sparse lookups with the
//! caller's [`AccessFilter`] pushed down into the backend.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::access::AccessFilter;
use crate::models::{AccessDescriptor, IndexEntry, SourceType};

/// Index namespace for all reads and writes.
///
/// Built once from configuration and threaded through, so writers and
/// readers can never disagree on where entries live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexNamespace(String);

impl IndexNamespace {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            bail!("index namespace must not be empty");
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A candidate returned from a dense or sparse lookup.
///
/// Carries enough provenance to fuse rankings and build results without
/// another round-trip, plus the access descriptor so the engine can
/// re-check the pushed-down filter.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry_id: String,
    /// Cosine similarity (dense) or negated BM25 (sparse); higher is better.
    pub raw_score: f64,
    pub source_type: SourceType,
    pub source_id: String,
    pub snippet: String,
    pub updated_at: DateTime<Utc>,
    pub access: AccessDescriptor,
}

/// Write count reported by the backend for one upsert call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertAck {
    pub written: usize,
}

/// What the pipeline needs to decide whether an entry changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFingerprint {
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace entries by id in a single call.
    async fn upsert(&self, ns: &IndexNamespace, entries: &[IndexEntry]) -> Result<UpsertAck>;

    /// Return the subset of `ids` present in the index.
    async fn existing_ids(&self, ns: &IndexNamespace, ids: &[String]) -> Result<Vec<String>>;

    /// Stored fingerprints for whichever of `ids` exist.
    async fn fingerprints(
        &self,
        ns: &IndexNamespace,
        ids: &[String],
    ) -> Result<HashMap<String, EntryFingerprint>>;

    /// Nearest entries by cosine similarity, restricted to `filter`.
    async fn dense_search(
        &self,
        ns: &IndexNamespace,
        query_vec: &[f32],
        filter: &AccessFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    /// Keyword matches on sparse terms, restricted to `filter`.
    async fn sparse_search(
        &self,
        ns: &IndexNamespace,
        terms: &[String],
        filter: &AccessFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>>;

    async fn count(&self, ns: &IndexNamespace) -> Result<usize>;
}

/// Snippet of at most `max_chars` characters.
pub fn snippet(content: &str, max_chars: usize) -> String {
    content.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_rejects_blank() {
        assert!(IndexNamespace::new("  ").is_err());
        assert_eq!(IndexNamespace::new(" prod ").unwrap().as_str(), "prod");
    }
}
