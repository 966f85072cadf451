//! Export-directory connector.
//!
//! Reads records that an upstream export job drops on disk:
//!
//! ```text
//! <root>/
//!   <partition>/
//!     _access.json        optional partition default descriptor
//!     2024-05-01.jsonl    one record per line
//!     backlog.json        a JSON array of records, or one record
//! ```
//!
//! Each subdirectory of `root` is a partition. Files inside it are matched
//! against `include_globs` (relative to the partition directory) and served
//! one file per page, in path order; the cursor is the index of the next
//! file. Files whose name starts with `_` or `.` are never records.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use sync_harness_core::connector::{AccessHints, FetchPage, SourceConnector};
use sync_harness_core::error::SyncError;
use sync_harness_core::models::{AccessDescriptor, SourceType};

use crate::config::SourceConfig;
use crate::wire::{descriptor_resolution, WireRecord};

const ACCESS_FILE: &str = "_access.json";

pub struct ExportDirConnector {
    source_type: SourceType,
    root: PathBuf,
    include: GlobSet,
    patterns: Vec<String>,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

fn io_error(path: &Path, e: impl std::fmt::Display) -> SyncError {
    SyncError::UpstreamTransient(format!("reading {}: {}", path.display(), e))
}

impl ExportDirConnector {
    pub fn new(source_type: SourceType, config: &SourceConfig) -> Result<Self> {
        let root = config
            .root
            .clone()
            .ok_or_else(|| anyhow::anyhow!("sources.{}.root is required", source_type))?;
        Ok(Self {
            source_type,
            root,
            include: build_globset(&config.include_globs)?,
            patterns: config.include_globs.clone(),
        })
    }

    fn partition_dir(&self, partition: &str) -> Result<PathBuf, SyncError> {
        if partition.is_empty() || partition.contains(['/', '\\']) || partition == ".." {
            return Err(SyncError::UpstreamPermanent(format!(
                "invalid partition key '{}'",
                partition
            )));
        }
        Ok(self.root.join(partition))
    }

    /// Record files of a partition, sorted by relative path.
    fn record_files(&self, dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| io_error(dir, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_hidden(&name) {
                continue;
            }
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            if self.include.is_match(relative) {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    fn partition_default(&self, dir: &Path) -> Result<AccessHints, SyncError> {
        let path = dir.join(ACCESS_FILE);
        if !path.exists() {
            return Ok(AccessHints::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        let descriptor: AccessDescriptor = serde_json::from_str(&text).map_err(|e| {
            SyncError::UpstreamPermanent(format!("parsing {}: {}", path.display(), e))
        })?;
        Ok(AccessHints {
            partition_default: descriptor_resolution(Some(descriptor), ""),
        })
    }
}

fn parse_records(path: &Path, text: &str) -> Result<Vec<WireRecord>, SyncError> {
    let parse_err =
        |e: serde_json::Error| SyncError::UpstreamPermanent(format!("parsing {}: {}", path.display(), e));

    if path.extension().is_some_and(|ext| ext == "jsonl") {
        return text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(parse_err))
            .collect();
    }

    let value: serde_json::Value = serde_json::from_str(text).map_err(parse_err)?;
    if value.is_array() {
        serde_json::from_value(value).map_err(parse_err)
    } else {
        Ok(vec![serde_json::from_value(value).map_err(parse_err)?])
    }
}

#[async_trait]
impl SourceConnector for ExportDirConnector {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    fn describe(&self) -> String {
        format!(
            "filesystem export at {} ({})",
            self.root.display(),
            self.patterns.join(", ")
        )
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Err(SyncError::UpstreamPermanent(format!(
                "export root does not exist: {}",
                self.root.display()
            ))
            .into());
        }
        let mut partitions = Vec::new();
        let entries = std::fs::read_dir(&self.root).map_err(|e| io_error(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.root, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() && !is_hidden(&name) {
                partitions.push(name);
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    async fn fetch_changed_since(
        &self,
        partition: &str,
        since: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<FetchPage> {
        let dir = self.partition_dir(partition)?;
        let files = self.record_files(&dir)?;
        let index: usize = match cursor {
            None => 0,
            Some(c) => c.parse().map_err(|_| {
                SyncError::UpstreamPermanent(format!("invalid cursor '{}' for {}", c, partition))
            })?,
        };

        let access_hints = self.partition_default(&dir)?;
        let Some(path) = files.get(index) else {
            return Ok(FetchPage {
                records: Vec::new(),
                next_cursor: None,
                access_hints,
            });
        };

        let text = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
        let records = parse_records(path, &text)?
            .into_iter()
            .filter(|r| r.updated_at >= since)
            .map(WireRecord::into_raw)
            .collect();

        let next = index + 1;
        Ok(FetchPage {
            records,
            next_cursor: (next < files.len()).then(|| next.to_string()),
            access_hints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_harness_core::models::Resolution;

    fn connector(root: &Path) -> ExportDirConnector {
        let config = crate::config::parse_config(&format!(
            "[db]\npath = \"x.sqlite\"\n[sources.chat]\nconnector = \"filesystem\"\nroot = \"{}\"\n",
            root.display()
        ))
        .unwrap();
        ExportDirConnector::new(SourceType::Chat, config.source(SourceType::Chat).unwrap()).unwrap()
    }

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let general = dir.path().join("general");
        std::fs::create_dir_all(&general).unwrap();
        std::fs::write(
            general.join("_access.json"),
            r#"{"visibility": "restricted", "scope_key": "general"}"#,
        )
        .unwrap();
        std::fs::write(
            general.join("a.jsonl"),
            concat!(
                r#"{"id": "m1", "text": "old message", "updated_at": "2024-01-01T00:00:00Z"}"#,
                "\n",
                r#"{"id": "m2", "text": "deploy done", "updated_at": "2024-05-01T00:00:00Z"}"#,
                "\n"
            ),
        )
        .unwrap();
        std::fs::write(
            general.join("b.json"),
            r#"[{"id": "m3", "text": "public note", "updated_at": "2024-05-02T00:00:00Z",
                 "access": {"visibility": "public"}}]"#,
        )
        .unwrap();
        std::fs::write(general.join("notes.txt"), "not a record").unwrap();
        std::fs::create_dir_all(dir.path().join("random")).unwrap();
        std::fs::create_dir_all(dir.path().join("_staging")).unwrap();
        dir
    }

    #[tokio::test]
    async fn lists_partition_directories() {
        let dir = setup();
        let c = connector(dir.path());
        assert_eq!(c.partitions().await.unwrap(), vec!["general", "random"]);
    }

    #[tokio::test]
    async fn pages_one_file_at_a_time_with_since_filter() {
        let dir = setup();
        let c = connector(dir.path());
        let since = DateTime::parse_from_rfc3339("2024-04-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let first = c.fetch_changed_since("general", since, None).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].source_id, "m2");
        assert!(!first.records[0].access.is_resolved());
        assert_eq!(
            first.access_hints.partition_default,
            Resolution::Resolved(AccessDescriptor::scoped("general"))
        );
        assert_eq!(first.next_cursor.as_deref(), Some("1"));

        let second = c
            .fetch_changed_since("general", since, first.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.records[0].source_id, "m3");
        assert!(second.records[0].access.is_resolved());
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn empty_partition_has_no_default_and_no_records() {
        let dir = setup();
        let c = connector(dir.path());
        let page = c
            .fetch_changed_since("random", Utc::now(), None)
            .await
            .unwrap();
        assert!(page.records.is_empty());
        assert!(page.next_cursor.is_none());
        assert!(!page.access_hints.partition_default.is_resolved());
    }

    #[tokio::test]
    async fn malformed_file_is_permanent() {
        let dir = setup();
        std::fs::write(dir.path().join("random").join("bad.json"), "{not json").unwrap();
        let c = connector(dir.path());
        let err = c
            .fetch_changed_since("random", Utc::now(), None)
            .await
            .unwrap_err();
        assert_eq!(
            sync_harness_core::error::classify(&err),
            sync_harness_core::error::ErrorClass::UpstreamPermanent
        );
    }
}
