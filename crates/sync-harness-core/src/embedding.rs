//! Embedder trait, the offline hash embedder, and vector utilities.
//!
//! Network and model-backed providers (OpenAI, Ollama, fastembed) live in
//! the `sync-harness` app crate. This module holds what every backend
//! shares: the [`Embedder`] contract, provider-sized batching via
//! [`embed_all`], and BLOB encoding for vectors stored in SQLite.

use anyhow::{bail, Result};
use async_trait::async_trait;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Largest number of texts accepted by one [`embed_batch`](Embedder::embed_batch) call.
    fn max_batch_items(&self) -> usize;
    /// Embed up to `max_batch_items` texts, returning one vector per text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed `texts` in provider-sized groups, preserving order.
///
/// A provider that returns the wrong number of vectors, or vectors of the
/// wrong width, is an error: a silent mismatch would attach embeddings to
/// the wrong records.
pub async fn embed_all(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let group = embedder.max_batch_items().max(1);
    let mut out = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(group) {
        let vectors = embedder.embed_batch(chunk).await?;
        if vectors.len() != chunk.len() {
            bail!(
                "embedder {} returned {} vectors for {} texts",
                embedder.model_name(),
                vectors.len(),
                chunk.len()
            );
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != embedder.dims()) {
            bail!(
                "embedder {} returned a {}-dim vector, expected {}",
                embedder.model_name(),
                bad.len(),
                embedder.dims()
            );
        }
        out.extend(vectors);
    }
    Ok(out)
}

/// Embed a single query string.
pub async fn embed_query(embedder: &dyn Embedder, query: &str) -> Result<Vec<f32>> {
    let mut vectors = embed_all(embedder, &[query.to_string()]).await?;
    match vectors.pop() {
        Some(v) => Ok(v),
        None => bail!("embedder {} returned no vector", embedder.model_name()),
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic feature-hashing embedder.
///
/// Each token and adjacent token pair is hashed with FNV-1a into a signed
/// bucket; the result is L2-normalized. No network, no model files, so it
/// is the default provider and the one used throughout the test suite.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
    batch: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            batch: 256,
        }
    }

    pub fn with_batch_size(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut add = |feature: &[u8], weight: f32| {
            let h = fnv1a(feature);
            let idx = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign * weight;
        };

        for token in &tokens {
            add(token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            add(bigram.as_bytes(), 0.5);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "fnv1a-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_items(&self) -> usize {
        self.batch
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use sync_harness_core::embedding::{blob_to_vec, vec_to_blob};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hash_embedding_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64);
        let a = e.embed_text("payment gateway timeout");
        assert_eq!(a, e.embed_text("payment gateway timeout"));
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_texts_are_closer_than_unrelated() {
        let e = HashEmbedder::new(256);
        let q = e.embed_text("payment gateway");
        let near = e.embed_text("the payment gateway returned 502");
        let far = e.embed_text("quarterly offsite agenda");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashEmbedder::new(8);
        assert!(e.embed_text("  ").iter().all(|x| *x == 0.0));
    }

    struct CountingEmbedder {
        calls: AtomicUsize,
        inner: HashEmbedder,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        fn max_batch_items(&self) -> usize {
            10
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            assert!(texts.len() <= 10);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
    }

    #[test]
    fn embed_all_groups_by_provider_limit() {
        let e = CountingEmbedder {
            calls: AtomicUsize::new(0),
            inner: HashEmbedder::new(16),
        };
        let texts: Vec<String> = (0..25).map(|i| format!("text {i}")).collect();
        let vectors = block_on(embed_all(&e, &texts)).unwrap();
        assert_eq!(vectors.len(), 25);
        assert_eq!(e.calls.load(Ordering::SeqCst), 3);
        assert_eq!(vectors[24], e.inner.embed_text("text 24"));
    }

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }
}
