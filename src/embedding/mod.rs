//! Embedding providers.
//!
//! Every provider implements the core [`Embedder`] trait:
//! - **`hash`**: [`HashEmbedder`], deterministic feature hashing, offline.
//! - **`openai`**: [`OpenAiEmbedder`], `POST /v1/embeddings`.
//! - **`ollama`**: [`OllamaEmbedder`], `POST /api/embed` on a local Ollama.
//! - **`local`**: `LocalEmbedder`, fastembed models run in-process
//!   (feature `local-embeddings-fastembed`).
//!
//! # Retry Strategy
//!
//! The HTTP providers retry under the configured [`RetryPolicy`]:
//! - HTTP 429 and 5xx, network errors → [`SyncError::UpstreamTransient`], retried
//! - other HTTP 4xx, malformed bodies → [`SyncError::UpstreamPermanent`], not retried

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::warn;

use sync_harness_core::embedding::{Embedder, HashEmbedder};
use sync_harness_core::error::SyncError;
use sync_harness_core::retry::{RetryDecision, RetryPolicy};

use crate::config::{EmbeddingConfig, DEFAULT_HASH_DIMS};

/// Build the embedder named by `embedding.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(
            HashEmbedder::new(config.dims.unwrap_or(DEFAULT_HASH_DIMS))
                .with_batch_size(config.batch_size),
        )),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn retry_policy(config: &EmbeddingConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.max_retries.saturating_add(1),
        Duration::from_secs(1),
        Duration::from_secs(32),
    )
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// Send a JSON request, retrying transient failures under `policy`.
async fn post_json_with_retry(
    label: &str,
    policy: &RetryPolicy,
    request: impl Fn() -> reqwest::RequestBuilder,
) -> Result<serde_json::Value> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match request().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .json::<serde_json::Value>()
                        .await
                        .map_err(|e| {
                            anyhow::Error::from(SyncError::UpstreamPermanent(format!(
                                "{label} returned invalid JSON: {e}"
                            )))
                        });
                }
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    SyncError::UpstreamTransient(format!("{label} API error {status}: {body_text}"))
                } else {
                    SyncError::UpstreamPermanent(format!("{label} API error {status}: {body_text}"))
                }
            }
            Err(e) => SyncError::UpstreamTransient(format!("{label} connection error: {e}")),
        };

        match policy.decide(err.class(), attempt) {
            RetryDecision::Retry { after } => {
                warn!(provider = label, attempt, delay_ms = after.as_millis() as u64, error = %err, "Retrying embedding request");
                tokio::time::sleep(after).await;
            }
            RetryDecision::GiveUp => return Err(err.into()),
        }
    }
}

fn parse_vector(value: &serde_json::Value, label: &str) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| SyncError::UpstreamPermanent(format!("{label}: embedding is not an array")))?;
    items
        .iter()
        .map(|v| {
            v.as_f64().map(|f| f as f32).ok_or_else(|| {
                anyhow::Error::from(SyncError::UpstreamPermanent(format!(
                    "{label}: non-numeric embedding value"
                )))
            })
        })
        .collect()
}

// ============ OpenAI ============

/// Embeddings from the OpenAI API. Reads `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
    policy: RetryPolicy,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("embedding.model required for OpenAI provider")?;
        let dims = config.dims.context("embedding.dims required for OpenAI provider")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set")?;

        Ok(Self {
            client: http_client(config)?,
            api_key,
            model,
            dims,
            batch_size: config.batch_size,
            policy: retry_policy(config),
        })
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| SyncError::UpstreamPermanent("OpenAI response missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| SyncError::UpstreamPermanent("OpenAI response missing embedding".into()))?;
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_items(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_json_with_retry("OpenAI", &self.policy, || {
            self.client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
        })
        .await?;
        parse_openai_response(&json)
    }
}

// ============ Ollama ============

/// Embeddings from a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    policy: RetryPolicy,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("embedding.model required for Ollama provider")?;
        let dims = config.dims.context("embedding.dims required for Ollama provider")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            model,
            dims,
            batch_size: config.batch_size,
            policy: retry_policy(config),
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| SyncError::UpstreamPermanent("Ollama response missing embeddings array".into()))?
        .iter()
        .map(|e| parse_vector(e, "Ollama"))
        .collect()
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_items(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let endpoint = format!("{}/api/embed", self.url);
        let json = post_json_with_retry("Ollama", &self.policy, || {
            self.client.post(&endpoint).json(&body)
        })
        .await?;
        parse_ollama_response(&json)
    }
}

// ============ Local (fastembed) ============

/// In-process embeddings via fastembed. The model is downloaded from
/// Hugging Face on first use and cached; later runs are offline.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    model: fastembed::EmbeddingModel,
    dims: usize,
    batch_size: usize,
    loaded: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (model, default_dims) = match model_name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "bge-large-en-v1.5" => (fastembed::EmbeddingModel::BGELargeENV15, 1024),
            "nomic-embed-text-v1.5" => (fastembed::EmbeddingModel::NomicEmbedTextV15, 768),
            other => bail!(
                "Unknown local embedding model: '{}'. Supported models: all-minilm-l6-v2, \
                 bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1.5",
                other
            ),
        };
        Ok(Self {
            model_name,
            model,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size,
            loaded: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_items(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let loaded = Arc::clone(&self.loaded);
        let model = self.model.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = loaded
                .lock()
                .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(model);
            }
            let Some(model) = guard.as_mut() else {
                bail!("local embedding model unavailable");
            };
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}
