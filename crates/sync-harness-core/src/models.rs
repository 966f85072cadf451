//! Core data models used throughout Sync Harness.
//!
//! These types represent the records, cached batches, and index entries
//! that flow through the fetch → cache → ingest → query pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One tag per upstream system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    IssueTracker,
    Chat,
    Meetings,
    Documents,
    TimeTracking,
}

impl SourceType {
    pub const ALL: [SourceType; 5] = [
        SourceType::IssueTracker,
        SourceType::Chat,
        SourceType::Meetings,
        SourceType::Documents,
        SourceType::TimeTracking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::IssueTracker => "issue_tracker",
            SourceType::Chat => "chat",
            SourceType::Meetings => "meetings",
            SourceType::Documents => "documents",
            SourceType::TimeTracking => "time_tracking",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "issue_tracker" => Ok(SourceType::IssueTracker),
            "chat" => Ok(SourceType::Chat),
            "meetings" => Ok(SourceType::Meetings),
            "documents" => Ok(SourceType::Documents),
            "time_tracking" => Ok(SourceType::TimeTracking),
            _ => bail!(
                "Unknown source type: '{}'. Available: issue_tracker, chat, meetings, documents, time_tracking",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Restricted,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Restricted => "restricted",
        }
    }
}

impl FromStr for Visibility {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "restricted" => Ok(Visibility::Restricted),
            other => bail!("Unknown visibility: '{}'", other),
        }
    }
}

/// Declares who may see a record.
///
/// Restricted descriptors must name at least one of a scope, a principal,
/// or an owner; see [`AccessDescriptor::is_well_formed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDescriptor {
    pub visibility: Visibility,
    /// Channel or project identifier the record belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_key: Option<String>,
    /// Explicit identities allowed to read the record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principal_list: Vec<String>,
    /// Author identity; always allowed to read its own records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl AccessDescriptor {
    pub fn public() -> Self {
        Self {
            visibility: Visibility::Public,
            scope_key: None,
            principal_list: Vec::new(),
            owner: None,
        }
    }

    pub fn scoped(scope_key: impl Into<String>) -> Self {
        Self {
            visibility: Visibility::Restricted,
            scope_key: Some(scope_key.into()),
            principal_list: Vec::new(),
            owner: None,
        }
    }

    pub fn principals<I, S>(principals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            visibility: Visibility::Restricted,
            scope_key: None,
            principal_list: principals.into_iter().map(Into::into).collect(),
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// A restricted descriptor that grants nobody access is malformed.
    pub fn is_well_formed(&self) -> bool {
        match self.visibility {
            Visibility::Public => true,
            Visibility::Restricted => {
                self.scope_key.as_deref().is_some_and(|s| !s.trim().is_empty())
                    || self.principal_list.iter().any(|p| !p.trim().is_empty())
                    || self.owner.as_deref().is_some_and(|o| !o.trim().is_empty())
            }
        }
    }
}

/// Scalar attribute value carried alongside a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

pub type Attributes = BTreeMap<String, AttrValue>;

/// Outcome of a cross-reference lookup performed by a connector.
///
/// Replaces "fall back to a sentinel" handling: callers must decide what to
/// do with an unresolved value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Resolved(T),
    Unresolved { reason: String },
}

impl<T> Resolution<T> {
    pub fn unresolved(reason: impl Into<String>) -> Self {
        Resolution::Unresolved {
            reason: reason.into(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    /// Keep a resolved value; otherwise try `fallback`.
    pub fn or_else(self, fallback: impl FnOnce() -> Resolution<T>) -> Resolution<T> {
        match self {
            Resolution::Resolved(v) => Resolution::Resolved(v),
            Resolution::Unresolved { .. } => fallback(),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Resolution::Resolved(v) => Ok(v),
            Resolution::Unresolved { reason } => Err(reason),
        }
    }
}

impl<T> From<Option<T>> for Resolution<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Resolution::Resolved(v),
            None => Resolution::unresolved("value not provided"),
        }
    }
}

/// A record as returned by a connector, before access resolution.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub source_id: String,
    pub content_text: String,
    pub updated_at: DateTime<Utc>,
    pub access: Resolution<AccessDescriptor>,
    pub attributes: Attributes,
}

/// One unit of content from an upstream system. Immutable once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub source_type: SourceType,
    pub content_text: String,
    pub updated_at: DateTime<Utc>,
    pub access_descriptor: AccessDescriptor,
    #[serde(default)]
    pub attributes: Attributes,
}

impl SourceRecord {
    pub fn entry_id(&self) -> String {
        entry_id(self.source_type, &self.source_id)
    }

    /// Fingerprint of everything an index entry is built from: text,
    /// `updated_at`, access descriptor, and attributes. A change to any of
    /// them, including a permission change alone, forces a rewrite.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content_text.as_bytes());
        hasher.update(self.updated_at.timestamp_millis().to_le_bytes());
        hasher.update([0x1f]);
        hasher.update(serde_json::to_vec(&self.access_descriptor).unwrap_or_default());
        hasher.update([0x1f]);
        hasher.update(serde_json::to_vec(&self.attributes).unwrap_or_default());
        format!("{:x}", hasher.finalize())
    }
}

/// Deterministic index id for a record, so re-ingestion overwrites in place.
pub fn entry_id(source_type: SourceType, source_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_type.as_str().as_bytes());
    hasher.update([0x1f]);
    hasher.update(source_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A durably-persisted fetch result for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheBatch {
    pub source_type: SourceType,
    pub partition_key: String,
    pub records: Vec<SourceRecord>,
    /// Captured before the first upstream call for the partition.
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Ingested,
    Quarantined,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Ingested => "ingested",
            BatchStatus::Quarantined => "quarantined",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "ingested" => Ok(BatchStatus::Ingested),
            "quarantined" => Ok(BatchStatus::Quarantined),
            other => bail!("Unknown batch status: '{}'", other),
        }
    }
}

/// The unit stored in the search index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: String,
    pub source_type: SourceType,
    pub source_id: String,
    /// Content after truncation to the field budget.
    pub content: String,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
    pub embedding_vector: Vec<f32>,
    pub sparse_terms: Vec<String>,
    /// Serialized metadata, never larger than the configured byte budget.
    pub metadata_json: String,
    pub access_descriptor: AccessDescriptor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_parses_both_spellings() {
        assert_eq!(
            "issue-tracker".parse::<SourceType>().unwrap(),
            SourceType::IssueTracker
        );
        assert_eq!(
            "time_tracking".parse::<SourceType>().unwrap(),
            SourceType::TimeTracking
        );
        assert!("wiki".parse::<SourceType>().is_err());
    }

    #[test]
    fn entry_id_is_deterministic_and_source_scoped() {
        let a = entry_id(SourceType::Chat, "msg-1");
        assert_eq!(a, entry_id(SourceType::Chat, "msg-1"));
        assert_ne!(a, entry_id(SourceType::Documents, "msg-1"));
        assert_ne!(a, entry_id(SourceType::Chat, "msg-2"));
    }

    #[test]
    fn restricted_descriptor_must_grant_someone() {
        let empty = AccessDescriptor {
            visibility: Visibility::Restricted,
            scope_key: Some("  ".to_string()),
            principal_list: vec![],
            owner: None,
        };
        assert!(!empty.is_well_formed());
        assert!(AccessDescriptor::public().is_well_formed());
        assert!(AccessDescriptor::scoped("projectX").is_well_formed());
        assert!(AccessDescriptor::principals(["alice"]).is_well_formed());
    }

    #[test]
    fn resolution_falls_back_only_when_unresolved() {
        let resolved: Resolution<u8> = Resolution::Resolved(1);
        assert_eq!(resolved.or_else(|| Resolution::Resolved(2)), Resolution::Resolved(1));

        let missing: Resolution<u8> = Resolution::unresolved("no channel");
        assert_eq!(missing.or_else(|| Resolution::Resolved(2)), Resolution::Resolved(2));
    }

    #[test]
    fn content_hash_tracks_version() {
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut record = SourceRecord {
            source_id: "t-1".to_string(),
            source_type: SourceType::IssueTracker,
            content_text: "Checkout fails".to_string(),
            updated_at: ts,
            access_descriptor: AccessDescriptor::public(),
            attributes: Attributes::new(),
        };
        let first = record.content_hash();
        record.updated_at = ts + chrono::Duration::seconds(1);
        assert_ne!(first, record.content_hash());
    }

    #[test]
    fn content_hash_covers_access_and_attributes() {
        let record = SourceRecord {
            source_id: "t-1".to_string(),
            source_type: SourceType::IssueTracker,
            content_text: "Checkout fails".to_string(),
            updated_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            access_descriptor: AccessDescriptor::public(),
            attributes: Attributes::new(),
        };
        let base = record.content_hash();
        assert_eq!(base, record.clone().content_hash());

        let mut restricted = record.clone();
        restricted.access_descriptor = AccessDescriptor::scoped("projectY");
        assert_ne!(base, restricted.content_hash());

        let mut owned = restricted.clone();
        owned.access_descriptor = AccessDescriptor::scoped("projectY").with_owner("alice");
        assert_ne!(restricted.content_hash(), owned.content_hash());

        let mut tagged = record;
        tagged
            .attributes
            .insert("status".to_string(), AttrValue::Text("closed".to_string()));
        assert_ne!(base, tagged.content_hash());
    }
}
