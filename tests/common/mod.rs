#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use sync_harness::config::{parse_config, Config};
use sync_harness::registry::ConnectorRegistry;
use sync_harness::services::Services;
use sync_harness::sqlite_index::SqliteIndex;
use sync_harness_core::access::AccessFilter;
use sync_harness_core::connector::{AccessHints, FetchPage, SourceConnector};
use sync_harness_core::embedding::HashEmbedder;
use sync_harness_core::error::SyncError;
use sync_harness_core::index::memory::InMemoryIndex;
use sync_harness_core::index::{Candidate, EntryFingerprint, IndexNamespace, SearchIndex, UpsertAck};
use sync_harness_core::models::{
    AccessDescriptor, Attributes, IndexEntry, RawRecord, Resolution, SourceType,
};

pub fn raw(id: &str, text: &str, updated_at: DateTime<Utc>, access: AccessDescriptor) -> RawRecord {
    RawRecord {
        source_id: id.to_string(),
        content_text: text.to_string(),
        updated_at,
        access: Resolution::Resolved(access),
        attributes: Attributes::new(),
    }
}

pub fn raw_unresolved(id: &str, text: &str, updated_at: DateTime<Utc>) -> RawRecord {
    RawRecord {
        source_id: id.to_string(),
        content_text: text.to_string(),
        updated_at,
        access: Resolution::unresolved("channel membership lookup failed"),
        attributes: Attributes::new(),
    }
}

/// `n` public records with ids `<prefix>-0000..`, all updated at `at`.
pub fn records(prefix: &str, n: usize, at: DateTime<Utc>) -> Vec<RawRecord> {
    (0..n)
        .map(|i| {
            raw(
                &format!("{prefix}-{i:04}"),
                &format!("{prefix} record number {i}"),
                at,
                AccessDescriptor::public(),
            )
        })
        .collect()
}

#[derive(Default)]
struct PartitionScript {
    records: Vec<RawRecord>,
    failures: VecDeque<SyncError>,
    /// Return the first page with a cursor pointing back at itself.
    stall: bool,
    default_access: Option<AccessDescriptor>,
}

/// Connector fed from memory, with per-partition scripted failures.
///
/// Pages hold `page_size` records; the cursor is the next offset.
pub struct ScriptedConnector {
    source_type: SourceType,
    partitions: Vec<String>,
    page_size: usize,
    scripts: Mutex<HashMap<String, PartitionScript>>,
    fetch_calls: Mutex<HashMap<String, usize>>,
    partition_calls: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(source_type: SourceType, partitions: &[&str]) -> Self {
        Self {
            source_type,
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
            page_size: 100,
            scripts: Mutex::new(HashMap::new()),
            fetch_calls: Mutex::new(HashMap::new()),
            partition_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn set_records(&self, partition: &str, records: Vec<RawRecord>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(partition.to_string())
            .or_default()
            .records = records;
    }

    pub fn fail_next(&self, partition: &str, error: SyncError) {
        self.scripts
            .lock()
            .unwrap()
            .entry(partition.to_string())
            .or_default()
            .failures
            .push_back(error);
    }

    pub fn stall(&self, partition: &str) {
        self.scripts
            .lock()
            .unwrap()
            .entry(partition.to_string())
            .or_default()
            .stall = true;
    }

    pub fn set_partition_access(&self, partition: &str, access: AccessDescriptor) {
        self.scripts
            .lock()
            .unwrap()
            .entry(partition.to_string())
            .or_default()
            .default_access = Some(access);
    }

    /// Fetch calls for `partition`, failed ones included.
    pub fn calls(&self, partition: &str) -> usize {
        self.fetch_calls
            .lock()
            .unwrap()
            .get(partition)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    fn describe(&self) -> String {
        format!("scripted ({} partitions)", self.partitions.len())
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        self.partition_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.partitions.clone())
    }

    async fn fetch_changed_since(
        &self,
        partition: &str,
        since: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<FetchPage> {
        *self
            .fetch_calls
            .lock()
            .unwrap()
            .entry(partition.to_string())
            .or_default() += 1;

        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(partition.to_string()).or_default();
        if let Some(err) = script.failures.pop_front() {
            return Err(err.into());
        }

        let changed: Vec<RawRecord> = script
            .records
            .iter()
            .filter(|r| r.updated_at >= since)
            .cloned()
            .collect();
        let offset: usize = match cursor {
            Some(c) => c.parse()?,
            None => 0,
        };
        let end = (offset + self.page_size).min(changed.len());
        let page = changed.get(offset..end).unwrap_or_default().to_vec();
        let next_cursor = if script.stall {
            Some(offset.to_string())
        } else if end < changed.len() {
            Some(end.to_string())
        } else {
            None
        };

        Ok(FetchPage {
            records: page,
            next_cursor,
            access_hints: AccessHints {
                partition_default: script
                    .default_access
                    .clone()
                    .map(Resolution::Resolved)
                    .unwrap_or_else(|| Resolution::unresolved("no partition default")),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// `upsert` returns an error.
    FailUpserts,
    /// `upsert` acknowledges every entry but stores nothing.
    DropWrites,
}

/// In-memory index with injectable write faults.
pub struct FaultyIndex {
    pub inner: InMemoryIndex,
    fault: Mutex<Fault>,
}

impl FaultyIndex {
    pub fn new(fault: Fault) -> Self {
        Self {
            inner: InMemoryIndex::new(),
            fault: Mutex::new(fault),
        }
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock().unwrap() = fault;
    }
}

#[async_trait]
impl SearchIndex for FaultyIndex {
    async fn upsert(&self, ns: &IndexNamespace, entries: &[IndexEntry]) -> Result<UpsertAck> {
        let fault = *self.fault.lock().unwrap();
        match fault {
            Fault::None => self.inner.upsert(ns, entries).await,
            Fault::FailUpserts => Err(anyhow!("index write rejected")),
            Fault::DropWrites => Ok(UpsertAck {
                written: entries.len(),
            }),
        }
    }

    async fn existing_ids(&self, ns: &IndexNamespace, ids: &[String]) -> Result<Vec<String>> {
        self.inner.existing_ids(ns, ids).await
    }

    async fn fingerprints(
        &self,
        ns: &IndexNamespace,
        ids: &[String],
    ) -> Result<HashMap<String, EntryFingerprint>> {
        self.inner.fingerprints(ns, ids).await
    }

    async fn dense_search(
        &self,
        ns: &IndexNamespace,
        query_vec: &[f32],
        filter: &AccessFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        self.inner.dense_search(ns, query_vec, filter, limit).await
    }

    async fn sparse_search(
        &self,
        ns: &IndexNamespace,
        terms: &[String],
        filter: &AccessFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        self.inner.sparse_search(ns, terms, filter, limit).await
    }

    async fn count(&self, ns: &IndexNamespace) -> Result<usize> {
        self.inner.count(ns).await
    }
}

/// Config for a temp database with one or more sources and fast retries.
pub fn test_config(dir: &TempDir, sources: &[SourceType], extra: &str) -> Config {
    let mut text = format!(
        r#"
[db]
path = "{db}"

[scheduler]
workers = 1
poll_interval_ms = 20
max_attempts = 3
backoff_base_secs = 1
backoff_max_secs = 4
lease_margin_secs = 30
recovery_grace_secs = 60
fetch_max_attempts = 3
fetch_backoff_ms = 1

[access.principals]
alice = ["projectX"]
bob = ["projectY"]
"#,
        db = dir.path().join("shx.sqlite").display()
    );
    for st in sources {
        text.push_str(&format!(
            "\n[sources.{st}]\nconnector = \"filesystem\"\nroot = \"{root}\"\nschedule = \"every 15m\"\npartition_delay_ms = 0\nlookback_secs = 86400\n",
            root = dir.path().join("unused").display()
        ));
    }
    text.push_str(extra);
    parse_config(&text).unwrap()
}

pub async fn open_services(
    config: Config,
    connectors: Vec<Arc<dyn SourceConnector>>,
    index: Arc<dyn SearchIndex>,
) -> Services {
    let mut registry = ConnectorRegistry::new();
    for c in connectors {
        registry.register(c);
    }
    Services::open_with(
        config,
        registry,
        index,
        Arc::new(HashEmbedder::new(64)),
    )
    .await
    .unwrap()
}

/// A [`SqliteIndex`] over the database `config` points at.
pub async fn sqlite_index(config: &Config) -> Arc<SqliteIndex> {
    let pool = sync_harness::db::connect(config).await.unwrap();
    sync_harness::migrate::apply(&pool).await.unwrap();
    Arc::new(SqliteIndex::new(pool))
}

pub fn minutes_ago(n: i64) -> DateTime<Utc> {
    Utc::now() - Duration::minutes(n)
}
