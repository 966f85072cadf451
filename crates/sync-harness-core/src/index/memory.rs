//! In-memory [`SearchIndex`] for tests and single-process use.
//!
//! Entries live in a `HashMap` behind `std::sync::RwLock`. Dense search is
//! brute-force cosine similarity; sparse search scores term overlap with an
//! IDF weight computed over the namespace.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::{Candidate, EntryFingerprint, IndexNamespace, SearchIndex, UpsertAck};
use crate::access::AccessFilter;
use crate::embedding::cosine_similarity;
use crate::models::IndexEntry;

type Key = (String, String);

#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<HashMap<Key, IndexEntry>>,
    upsert_calls: AtomicUsize,
    entries_written: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `upsert` calls served so far.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Total entries written across all `upsert` calls, rewrites included.
    pub fn entries_written(&self) -> usize {
        self.entries_written.load(Ordering::SeqCst)
    }

    /// Snapshot of one entry, for assertions.
    pub fn get(&self, ns: &IndexNamespace, id: &str) -> Result<Option<IndexEntry>> {
        let key = (ns.as_str().to_string(), id.to_string());
        Ok(self.read()?.get(&key).cloned())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Key, IndexEntry>>> {
        self.entries
            .read()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Key, IndexEntry>>> {
        self.entries
            .write()
            .map_err(|_| anyhow!("in-memory index lock poisoned"))
    }
}

fn candidate(entry: &IndexEntry, raw_score: f64) -> Candidate {
    Candidate {
        entry_id: entry.id.clone(),
        raw_score,
        source_type: entry.source_type,
        source_id: entry.source_id.clone(),
        snippet: entry.content.clone(),
        updated_at: entry.updated_at,
        access: entry.access_descriptor.clone(),
    }
}

fn rank(mut candidates: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.raw_score
            .total_cmp(&a.raw_score)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.entry_id.cmp(&b.entry_id))
    });
    candidates.truncate(limit);
    candidates
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn upsert(&self, ns: &IndexNamespace, entries: &[IndexEntry]) -> Result<UpsertAck> {
        let mut map = self.write()?;
        for entry in entries {
            map.insert((ns.as_str().to_string(), entry.id.clone()), entry.clone());
        }
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.entries_written
            .fetch_add(entries.len(), Ordering::SeqCst);
        Ok(UpsertAck {
            written: entries.len(),
        })
    }

    async fn existing_ids(&self, ns: &IndexNamespace, ids: &[String]) -> Result<Vec<String>> {
        let map = self.read()?;
        Ok(ids
            .iter()
            .filter(|id| map.contains_key(&(ns.as_str().to_string(), (*id).clone())))
            .cloned()
            .collect())
    }

    async fn fingerprints(
        &self,
        ns: &IndexNamespace,
        ids: &[String],
    ) -> Result<HashMap<String, EntryFingerprint>> {
        let map = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                map.get(&(ns.as_str().to_string(), id.clone())).map(|e| {
                    (
                        id.clone(),
                        EntryFingerprint {
                            content_hash: e.content_hash.clone(),
                            updated_at: e.updated_at,
                        },
                    )
                })
            })
            .collect())
    }

    async fn dense_search(
        &self,
        ns: &IndexNamespace,
        query_vec: &[f32],
        filter: &AccessFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let map = self.read()?;
        let candidates = map
            .iter()
            .filter(|((n, _), e)| n == ns.as_str() && filter.allows(&e.access_descriptor))
            .map(|(_, e)| {
                let score = cosine_similarity(query_vec, &e.embedding_vector) as f64;
                candidate(e, score)
            })
            .collect();
        Ok(rank(candidates, limit))
    }

    async fn sparse_search(
        &self,
        ns: &IndexNamespace,
        terms: &[String],
        filter: &AccessFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let map = self.read()?;
        let in_ns: Vec<&IndexEntry> = map
            .iter()
            .filter(|((n, _), _)| n == ns.as_str())
            .map(|(_, e)| e)
            .collect();

        // Document frequency is computed over the whole namespace, not the
        // filtered subset, matching what an FTS backend sees.
        let total = in_ns.len() as f64;
        let idf: HashMap<&str, f64> = terms
            .iter()
            .map(|t| {
                let df = in_ns
                    .iter()
                    .filter(|e| e.sparse_terms.iter().any(|s| s == t))
                    .count() as f64;
                (t.as_str(), (1.0 + (total - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        let candidates = in_ns
            .into_iter()
            .filter(|e| filter.allows(&e.access_descriptor))
            .filter_map(|e| {
                let entry_terms: HashSet<&str> = e.sparse_terms.iter().map(String::as_str).collect();
                let score: f64 = terms
                    .iter()
                    .filter(|t| entry_terms.contains(t.as_str()))
                    .map(|t| idf.get(t.as_str()).copied().unwrap_or(0.0))
                    .sum();
                (score > 0.0).then(|| candidate(e, score))
            })
            .collect();
        Ok(rank(candidates, limit))
    }

    async fn count(&self, ns: &IndexNamespace) -> Result<usize> {
        Ok(self.read()?.keys().filter(|(n, _)| n == ns.as_str()).count())
    }
}
