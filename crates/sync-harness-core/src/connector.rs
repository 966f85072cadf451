//! Source connector contract.
//!
//! One connector per upstream system. Connectors know nothing about the
//! cache, the index, or the scheduler: they list partitions and return
//! pages of records changed since a timestamp. Errors should be
//! [`SyncError::UpstreamTransient`](crate::error::SyncError::UpstreamTransient)
//! or [`SyncError::UpstreamPermanent`](crate::error::SyncError::UpstreamPermanent)
//! so the retry policy can tell them apart.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{AccessDescriptor, RawRecord, Resolution, SourceType};

/// Access information that applies to a whole page.
#[derive(Debug, Clone)]
pub struct AccessHints {
    /// Descriptor for records whose own lookup did not resolve.
    pub partition_default: Resolution<AccessDescriptor>,
}

impl Default for AccessHints {
    fn default() -> Self {
        Self {
            partition_default: Resolution::unresolved("no partition default"),
        }
    }
}

/// One page of a "changed since" listing.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub records: Vec<RawRecord>,
    /// Cursor for the next page; `None` when the listing is exhausted.
    pub next_cursor: Option<String>,
    pub access_hints: AccessHints,
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Human-readable description for `shx sources`.
    fn describe(&self) -> String;

    /// Partition keys (channels, projects, folders) to fetch each cycle.
    async fn partitions(&self) -> Result<Vec<String>>;

    /// Records in `partition` changed at or after `since`, one page at a time.
    ///
    /// Windows overlap across cycles; returning a record twice is fine.
    async fn fetch_changed_since(
        &self,
        partition: &str,
        since: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<FetchPage>;
}

/// Apply page hints to a record's own access lookup.
pub fn resolve_access(
    record: &RawRecord,
    hints: &AccessHints,
) -> Resolution<AccessDescriptor> {
    record
        .access
        .clone()
        .or_else(|| hints.partition_default.clone())
}
