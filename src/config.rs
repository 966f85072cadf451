//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the
//! `default_*` values below. `[sources.<source_type>]` tables are keyed by
//! the snake_case source type (`issue_tracker`, `chat`, ...).

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sync_harness_core::index::IndexNamespace;
use sync_harness_core::metadata::{
    MetadataBudget, DEFAULT_MAX_FIELD_CHARS, DEFAULT_MAX_METADATA_BYTES,
};
use sync_harness_core::models::SourceType;
use sync_harness_core::retry::RetryPolicy;
use sync_harness_core::search::{SearchParams, DEFAULT_RRF_K};

use crate::schedule::ScheduleSpec;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default, rename = "sources")]
    raw_sources: BTreeMap<String, SourceConfig>,
    /// Typed view of `[sources.*]`, filled in by [`parse_config`].
    #[serde(skip)]
    pub sources: BTreeMap<SourceType, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_max_metadata_bytes")]
    pub max_metadata_bytes: usize,
    #[serde(default = "default_max_field_chars")]
    pub max_field_chars: usize,
    /// Floor for the number of ids read back after each upsert.
    #[serde(default = "default_verify_min_sample")]
    pub verify_min_sample: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            max_metadata_bytes: default_max_metadata_bytes(),
            max_field_chars: default_max_field_chars(),
            verify_min_sample: default_verify_min_sample(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}
fn default_max_metadata_bytes() -> usize {
    DEFAULT_MAX_METADATA_BYTES
}
fn default_max_field_chars() -> usize {
    DEFAULT_MAX_FIELD_CHARS
}
fn default_verify_min_sample() -> usize {
    16
}

impl IndexConfig {
    pub fn namespace(&self) -> Result<IndexNamespace> {
        IndexNamespace::new(self.namespace.clone())
    }

    pub fn budget(&self) -> MetadataBudget {
        MetadataBudget {
            max_bytes: self.max_metadata_bytes,
            max_field_chars: self.max_field_chars,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Vector width used by the hash provider when `dims` is unset.
pub const DEFAULT_HASH_DIMS: usize = 256;

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidate_k: default_candidate_k(),
            final_limit: default_final_limit(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_rrf_k() -> f64 {
    DEFAULT_RRF_K
}
fn default_candidate_k() -> usize {
    50
}
fn default_final_limit() -> usize {
    12
}
fn default_snippet_chars() -> usize {
    480
}

impl RetrievalConfig {
    pub fn params(&self) -> SearchParams {
        SearchParams {
            rrf_k: self.rrf_k,
            candidate_k: self.candidate_k,
            snippet_chars: self.snippet_chars,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Task-level attempts before a cycle is permanently failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Added to the cycle budget to form the lease duration.
    #[serde(default = "default_lease_margin_secs")]
    pub lease_margin_secs: u64,
    /// How overdue a job must be before startup recovery enqueues it.
    #[serde(default = "default_recovery_grace_secs")]
    pub recovery_grace_secs: u64,
    /// Fetch-level attempts inside one cycle.
    #[serde(default = "default_fetch_max_attempts")]
    pub fetch_max_attempts: u32,
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            lease_margin_secs: default_lease_margin_secs(),
            recovery_grace_secs: default_recovery_grace_secs(),
            fetch_max_attempts: default_fetch_max_attempts(),
            fetch_backoff_ms: default_fetch_backoff_ms(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_secs() -> u64 {
    30
}
fn default_backoff_max_secs() -> u64 {
    1800
}
fn default_lease_margin_secs() -> u64 {
    120
}
fn default_recovery_grace_secs() -> u64 {
    300
}
fn default_fetch_max_attempts() -> u32 {
    3
}
fn default_fetch_backoff_ms() -> u64 {
    500
}

impl SchedulerConfig {
    pub fn task_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    pub fn fetch_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.fetch_max_attempts,
            Duration::from_millis(self.fetch_backoff_ms),
            Duration::from_millis(self.fetch_backoff_ms.saturating_mul(16)),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Ingested batches from this many most recent cycles survive a sweep.
    #[serde(default = "default_retention_cycles")]
    pub retention_cycles: usize,
    #[serde(default = "default_sweep_schedule")]
    pub sweep_schedule: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_cycles: default_retention_cycles(),
            sweep_schedule: default_sweep_schedule(),
        }
    }
}

fn default_retention_cycles() -> usize {
    5
}
fn default_sweep_schedule() -> String {
    "every 6h".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

/// Static caller directory used by the built-in resolver.
#[derive(Debug, Deserialize, Clone)]
pub struct AccessConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// identity → scope keys.
    #[serde(default)]
    pub principals: BTreeMap<String, Vec<String>>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            principals: BTreeMap::new(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// `filesystem` or `http`.
    pub connector: String,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Window used when no watermark has been committed yet.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    #[serde(default = "default_cycle_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backfill_timeout_secs")]
    pub backfill_timeout_secs: u64,
    /// Windows wider than this use `backfill_timeout_secs`.
    #[serde(default = "default_backfill_threshold_secs")]
    pub backfill_threshold_secs: u64,
    #[serde(default = "default_partition_delay_ms")]
    pub partition_delay_ms: u64,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    // filesystem
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,

    // http
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding a bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Fixed partition list; when empty the connector asks the upstream.
    #[serde(default)]
    pub partitions: Vec<String>,
}

fn default_schedule() -> String {
    "every 15m".to_string()
}
fn default_lookback_secs() -> u64 {
    3600
}
fn default_staleness_secs() -> u64 {
    7200
}
fn default_cycle_timeout_secs() -> u64 {
    600
}
fn default_backfill_timeout_secs() -> u64 {
    3600
}
fn default_backfill_threshold_secs() -> u64 {
    86_400
}
fn default_partition_delay_ms() -> u64 {
    250
}
fn default_max_pages() -> usize {
    10_000
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string(), "**/*.jsonl".to_string()]
}
fn default_page_size() -> usize {
    100
}

impl SourceConfig {
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lookback_secs as i64)
    }

    /// Wall-clock budget for a cycle covering `window_secs` of upstream history.
    pub fn cycle_budget(&self, window_secs: i64) -> Duration {
        if window_secs > self.backfill_threshold_secs as i64 {
            Duration::from_secs(self.backfill_timeout_secs)
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    pub fn partition_delay(&self) -> Duration {
        Duration::from_millis(self.partition_delay_ms)
    }
}

impl Config {
    pub fn source(&self, source_type: SourceType) -> Result<&SourceConfig> {
        self.sources
            .get(&source_type)
            .with_context(|| format!("No [sources.{}] section in config", source_type))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    for (key, source) in std::mem::take(&mut config.raw_sources) {
        let source_type: SourceType = key
            .parse()
            .with_context(|| format!("Invalid [sources.{}] section", key))?;
        config.sources.insert(source_type, source);
    }

    // Validate index
    config.index.namespace()?;
    if config.index.max_metadata_bytes < 256 {
        bail!("index.max_metadata_bytes must be >= 256");
    }
    if config.index.max_field_chars == 0 {
        bail!("index.max_field_chars must be > 0");
    }

    // Validate retrieval
    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.rrf_k <= 0.0 {
        bail!("retrieval.rrf_k must be > 0");
    }

    // Validate scheduler
    if config.scheduler.workers == 0 {
        bail!("scheduler.workers must be >= 1");
    }
    if config.scheduler.max_attempts == 0 || config.scheduler.fetch_max_attempts == 0 {
        bail!("scheduler.max_attempts and scheduler.fetch_max_attempts must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hash" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.unwrap_or(0) == 0 {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    config
        .cache
        .sweep_schedule
        .parse::<ScheduleSpec>()
        .with_context(|| "Invalid cache.sweep_schedule")?;

    // Validate sources
    for (source_type, source) in &config.sources {
        source
            .schedule
            .parse::<ScheduleSpec>()
            .with_context(|| format!("Invalid sources.{}.schedule", source_type))?;
        match source.connector.as_str() {
            "filesystem" => {
                if source.root.is_none() {
                    bail!("sources.{}.root is required for the filesystem connector", source_type);
                }
            }
            "http" => {
                if source.base_url.is_none() {
                    bail!("sources.{}.base_url is required for the http connector", source_type);
                }
                if source.page_size == 0 {
                    bail!("sources.{}.page_size must be > 0", source_type);
                }
            }
            other => bail!(
                "Unknown connector '{}' for sources.{}. Must be filesystem or http.",
                other,
                source_type
            ),
        }
        if source.max_pages == 0 {
            bail!("sources.{}.max_pages must be > 0", source_type);
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/shx.sqlite"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.index.namespace, "default");
        assert_eq!(config.index.max_metadata_bytes, 40_960);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert_eq!(config.access.cache_ttl_secs, 3600);
        assert!(config.sources.is_empty());
    }

    #[test]
    fn sources_are_keyed_by_source_type() {
        let text = format!(
            "{MINIMAL}\n[sources.chat]\nconnector = \"filesystem\"\nroot = \"./exports/chat\"\nschedule = \"every 5m\"\n"
        );
        let config = parse_config(&text).unwrap();
        let chat = config.source(SourceType::Chat).unwrap();
        assert_eq!(chat.schedule, "every 5m");
        assert_eq!(chat.lookback_secs, 3600);
        assert!(config.source(SourceType::Meetings).is_err());
    }

    #[test]
    fn unknown_source_key_is_rejected() {
        let text = format!("{MINIMAL}\n[sources.wiki]\nconnector = \"filesystem\"\nroot = \"x\"\n");
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn http_source_requires_base_url() {
        let text = format!("{MINIMAL}\n[sources.issue_tracker]\nconnector = \"http\"\n");
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn bad_schedule_is_rejected() {
        let text = format!(
            "{MINIMAL}\n[sources.chat]\nconnector = \"filesystem\"\nroot = \"x\"\nschedule = \"sometimes\"\n"
        );
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn backfill_windows_get_the_longer_budget() {
        let text = format!("{MINIMAL}\n[sources.chat]\nconnector = \"filesystem\"\nroot = \"x\"\n");
        let config = parse_config(&text).unwrap();
        let chat = config.source(SourceType::Chat).unwrap();
        assert_eq!(chat.cycle_budget(600), Duration::from_secs(600));
        assert_eq!(chat.cycle_budget(200_000), Duration::from_secs(3600));
    }
}
