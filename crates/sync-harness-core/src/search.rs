//! Hybrid query engine: parallel dense and sparse lookups fused with RRF.
//!
//! The engine operates entirely through the [`SearchIndex`] and
//! [`Embedder`] traits. The caller supplies an [`AccessFilter`] built from
//! its resolver; the engine pushes it into both lookups and re-checks every
//! candidate before anything is returned.
//!
//! # Scoring
//!
//! 1. Embed the query and run the dense lookup; concurrently, tokenize the
//!    query and run the sparse lookup. Both fetch `candidate_k` candidates.
//! 2. Fuse: `score(d) = Σ 1 / (k + rank_c(d))` over the channels containing
//!    `d`, with 1-based ranks and `k = 60` by default.
//! 3. Sort by score (desc), `updated_at` (desc), id (asc).
//! 4. Truncate to `top_k`.
//!
//! Any lookup failure yields [`SearchUnavailable`]; the engine never falls
//! back to partial or unfiltered results.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::access::AccessFilter;
use crate::embedding::{embed_query, Embedder};
use crate::index::{snippet, Candidate, IndexNamespace, SearchIndex};
use crate::models::SourceType;
use crate::terms::query_terms;

pub const DEFAULT_RRF_K: f64 = 60.0;

/// A ranked result with provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredResult {
    pub id: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub score: f64,
    /// Truncated content excerpt.
    pub content: String,
    pub updated_at: DateTime<Utc>,
    /// 1-based rank in the dense channel, if present there.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dense_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse_rank: Option<usize>,
}

/// Explicit "search is unavailable" signal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchUnavailable {
    #[error("dense lookup unavailable: {0}")]
    Dense(String),
    #[error("sparse lookup unavailable: {0}")]
    Sparse(String),
    #[error("index returned entry {entry_id} outside the caller's access filter")]
    FilterViolation { entry_id: String },
}

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    pub rrf_k: f64,
    /// Candidates fetched per channel before fusion.
    pub candidate_k: usize,
    pub snippet_chars: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            rrf_k: DEFAULT_RRF_K,
            candidate_k: 50,
            snippet_chars: 480,
        }
    }
}

pub struct HybridQueryEngine<I: SearchIndex + ?Sized> {
    index: Arc<I>,
    embedder: Arc<dyn Embedder>,
    namespace: IndexNamespace,
    params: SearchParams,
}

impl<I: SearchIndex + ?Sized> HybridQueryEngine<I> {
    pub fn new(
        index: Arc<I>,
        embedder: Arc<dyn Embedder>,
        namespace: IndexNamespace,
        params: SearchParams,
    ) -> Self {
        Self {
            index,
            embedder,
            namespace,
            params,
        }
    }

    pub fn namespace(&self) -> &IndexNamespace {
        &self.namespace
    }

    /// Run a filtered hybrid search. An empty query returns no results.
    pub async fn search(
        &self,
        query: &str,
        filter: &AccessFilter,
        top_k: usize,
    ) -> Result<Vec<ScoredResult>, SearchUnavailable> {
        let query = query.trim();
        if query.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let limit = self.params.candidate_k.max(top_k);
        let terms = query_terms(query);

        let dense = async {
            let vector = embed_query(self.embedder.as_ref(), query)
                .await
                .map_err(|e| SearchUnavailable::Dense(format!("{e:#}")))?;
            self.index
                .dense_search(&self.namespace, &vector, filter, limit)
                .await
                .map_err(|e| SearchUnavailable::Dense(format!("{e:#}")))
        };
        let sparse = async {
            if terms.is_empty() {
                return Ok(Vec::new());
            }
            self.index
                .sparse_search(&self.namespace, &terms, filter, limit)
                .await
                .map_err(|e| SearchUnavailable::Sparse(format!("{e:#}")))
        };

        let (dense, sparse) = futures::join!(dense, sparse);
        let (dense, sparse) = (dense?, sparse?);

        if let Some(leak) = dense
            .iter()
            .chain(sparse.iter())
            .find(|c| !filter.allows(&c.access))
        {
            return Err(SearchUnavailable::FilterViolation {
                entry_id: leak.entry_id.clone(),
            });
        }

        let mut results = reciprocal_rank_fusion(&dense, &sparse, self.params.rrf_k);
        results.truncate(top_k);
        for r in &mut results {
            r.content = snippet(&r.content, self.params.snippet_chars);
        }
        Ok(results)
    }
}

/// Fuse two ranked candidate lists with reciprocal rank fusion.
///
/// Ranks are the 1-based positions in each input list. Ties are broken by
/// `updated_at` (newest first), then by id.
pub fn reciprocal_rank_fusion(
    dense: &[Candidate],
    sparse: &[Candidate],
    k: f64,
) -> Vec<ScoredResult> {
    let mut fused: HashMap<&str, ScoredResult> = HashMap::new();

    for (channel, list) in [(0usize, dense), (1usize, sparse)] {
        for (i, c) in list.iter().enumerate() {
            let rank = i + 1;
            let entry = fused.entry(c.entry_id.as_str()).or_insert_with(|| ScoredResult {
                id: c.entry_id.clone(),
                source_type: c.source_type,
                source_id: c.source_id.clone(),
                score: 0.0,
                content: c.snippet.clone(),
                updated_at: c.updated_at,
                dense_rank: None,
                sparse_rank: None,
            });
            let slot = if channel == 0 {
                &mut entry.dense_rank
            } else {
                &mut entry.sparse_rank
            };
            // A backend that repeats an id keeps its best rank.
            if slot.is_none() {
                *slot = Some(rank);
                entry.score += 1.0 / (k + rank as f64);
            }
        }
    }

    let mut results: Vec<ScoredResult> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::index::memory::InMemoryIndex;
    use crate::index::{EntryFingerprint, UpsertAck};
    use crate::models::{AccessDescriptor, IndexEntry};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use futures::executor::block_on;

    fn cand(id: &str, secs: i64) -> Candidate {
        Candidate {
            entry_id: id.to_string(),
            raw_score: 0.0,
            source_type: SourceType::Documents,
            source_id: id.to_string(),
            snippet: String::new(),
            updated_at: DateTime::<Utc>::from_timestamp(secs, 0).unwrap(),
            access: AccessDescriptor::public(),
        }
    }

    #[test]
    fn rrf_rewards_presence_in_both_channels() {
        let dense = vec![cand("a", 0), cand("b", 0), cand("c", 0)];
        let sparse = vec![cand("c", 0), cand("d", 0)];
        let fused = reciprocal_rank_fusion(&dense, &sparse, DEFAULT_RRF_K);
        assert_eq!(fused[0].id, "c");
        let expected = 1.0 / 63.0 + 1.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-12);
        assert_eq!(fused[0].dense_rank, Some(3));
        assert_eq!(fused[0].sparse_rank, Some(1));
    }

    #[test]
    fn rrf_ties_break_on_recency_then_id() {
        let dense = vec![cand("b", 10)];
        let sparse = vec![cand("a", 10)];
        let fused = reciprocal_rank_fusion(&dense, &sparse, DEFAULT_RRF_K);
        assert_eq!(fused[0].id, "a");

        let dense = vec![cand("a", 10)];
        let sparse = vec![cand("b", 20)];
        let fused = reciprocal_rank_fusion(&dense, &sparse, DEFAULT_RRF_K);
        assert_eq!(fused[0].id, "b");
    }

    fn entry(embedder: &HashEmbedder, id: &str, text: &str, access: AccessDescriptor) -> IndexEntry {
        IndexEntry {
            id: id.to_string(),
            source_type: SourceType::IssueTracker,
            source_id: id.to_string(),
            content: text.to_string(),
            content_hash: id.to_string(),
            updated_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            embedding_vector: embedder.embed_text(text),
            sparse_terms: crate::terms::sparse_terms(text),
            metadata_json: "{}".to_string(),
            access_descriptor: access,
        }
    }

    #[test]
    fn restricted_entries_never_leak() {
        let embedder = HashEmbedder::new(128);
        let index = Arc::new(InMemoryIndex::new());
        let ns = IndexNamespace::new("test").unwrap();
        block_on(index.upsert(
            &ns,
            &[
                entry(&embedder, "x1", "payment gateway errors", AccessDescriptor::scoped("projectX")),
                entry(&embedder, "y1", "payment gateway", AccessDescriptor::scoped("projectY")),
            ],
        ))
        .unwrap();

        let engine = HybridQueryEngine::new(index, Arc::new(embedder), ns, SearchParams::default());
        let filter = AccessFilter::new("alice", ["projectX".to_string()]);
        let results = block_on(engine.search("payment gateway", &filter, 10)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "x1");
    }

    #[test]
    fn empty_query_returns_nothing() {
        let engine = HybridQueryEngine::new(
            Arc::new(InMemoryIndex::new()),
            Arc::new(HashEmbedder::new(8)),
            IndexNamespace::new("test").unwrap(),
            SearchParams::default(),
        );
        let results = block_on(engine.search("   ", &AccessFilter::public_only(), 5)).unwrap();
        assert!(results.is_empty());
    }

    /// Backend that ignores the pushed-down filter.
    struct LeakyIndex(InMemoryIndex);

    #[async_trait]
    impl SearchIndex for LeakyIndex {
        async fn upsert(&self, ns: &IndexNamespace, entries: &[IndexEntry]) -> Result<UpsertAck> {
            self.0.upsert(ns, entries).await
        }
        async fn existing_ids(&self, ns: &IndexNamespace, ids: &[String]) -> Result<Vec<String>> {
            self.0.existing_ids(ns, ids).await
        }
        async fn fingerprints(
            &self,
            ns: &IndexNamespace,
            ids: &[String],
        ) -> Result<HashMap<String, EntryFingerprint>> {
            self.0.fingerprints(ns, ids).await
        }
        async fn dense_search(
            &self,
            ns: &IndexNamespace,
            query_vec: &[f32],
            _filter: &AccessFilter,
            limit: usize,
        ) -> Result<Vec<Candidate>> {
            let everyone = AccessFilter::new("", ["projectY".to_string()]);
            self.0.dense_search(ns, query_vec, &everyone, limit).await
        }
        async fn sparse_search(
            &self,
            _ns: &IndexNamespace,
            _terms: &[String],
            _filter: &AccessFilter,
            _limit: usize,
        ) -> Result<Vec<Candidate>> {
            bail!("fts unavailable")
        }
        async fn count(&self, ns: &IndexNamespace) -> Result<usize> {
            self.0.count(ns).await
        }
    }

    #[test]
    fn backend_failures_are_unavailable_not_empty() {
        let embedder = HashEmbedder::new(32);
        let inner = InMemoryIndex::new();
        let ns = IndexNamespace::new("test").unwrap();
        block_on(inner.upsert(
            &ns,
            &[entry(&embedder, "y1", "payment gateway", AccessDescriptor::scoped("projectY"))],
        ))
        .unwrap();

        let engine = HybridQueryEngine::new(
            Arc::new(LeakyIndex(inner)),
            Arc::new(embedder),
            ns,
            SearchParams::default(),
        );
        let err = block_on(engine.search("payment", &AccessFilter::public_only(), 5)).unwrap_err();
        assert!(matches!(err, SearchUnavailable::Sparse(_)));

        let err = block_on(engine.search("!!", &AccessFilter::public_only(), 5)).unwrap_err();
        assert!(matches!(err, SearchUnavailable::FilterViolation { .. }));
    }
}
