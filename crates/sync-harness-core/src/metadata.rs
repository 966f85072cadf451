//! Deterministic metadata truncation.
//!
//! Every index entry carries a serialized metadata document that must stay
//! under a hard byte budget. Truncation order is fixed:
//!
//! 1. Every string field is capped at `max_field_chars`.
//! 2. While the serialized form is over budget, the longest text attribute
//!    is cut; once attributes are exhausted, the content is cut.
//! 3. Scalar attributes are dropped last, in reverse key order.
//!
//! Identity fields (`id`, `source_id`, `source_type`, `updated_at`,
//! `access`) are never touched. If they alone exceed the budget the record
//! fails with [`SyncError::MetadataOverBudget`] instead of being dropped.

use serde::Serialize;

use crate::error::SyncError;
use crate::models::{AccessDescriptor, AttrValue, Attributes, SourceRecord, SourceType};

pub const DEFAULT_MAX_METADATA_BYTES: usize = 40_960;
pub const DEFAULT_MAX_FIELD_CHARS: usize = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataBudget {
    pub max_bytes: usize,
    pub max_field_chars: usize,
}

impl Default for MetadataBudget {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_METADATA_BYTES,
            max_field_chars: DEFAULT_MAX_FIELD_CHARS,
        }
    }
}

/// Result of fitting a record into the budget.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedMetadata {
    pub json: String,
    /// Content as stored in the entry, after truncation.
    pub content: String,
    pub truncated: bool,
}

#[derive(Serialize)]
struct MetadataDoc<'a> {
    id: &'a str,
    source_type: SourceType,
    source_id: &'a str,
    updated_at: String,
    access: &'a AccessDescriptor,
    content: &'a str,
    attributes: &'a Attributes,
}

fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

/// Longest prefix of `s` that is at most `n` bytes and ends on a char boundary.
fn take_bytes(s: &str, n: usize) -> String {
    if s.len() <= n {
        return s.to_string();
    }
    let mut end = n;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn serialize(doc: &MetadataDoc<'_>) -> Result<String, SyncError> {
    serde_json::to_string(doc).map_err(|e| SyncError::IndexWrite(format!("metadata encode: {e}")))
}

/// Build the metadata document for `record`, truncated to `budget`.
pub fn build_metadata(
    id: &str,
    record: &SourceRecord,
    budget: MetadataBudget,
) -> Result<TruncatedMetadata, SyncError> {
    let mut truncated = false;

    let mut content = record.content_text.clone();
    if content.chars().count() > budget.max_field_chars {
        content = take_chars(&content, budget.max_field_chars);
        truncated = true;
    }

    let mut attributes = record.attributes.clone();
    for value in attributes.values_mut() {
        if let AttrValue::Text(text) = value {
            if text.chars().count() > budget.max_field_chars {
                *text = take_chars(text, budget.max_field_chars);
                truncated = true;
            }
        }
    }

    let updated_at = record.updated_at.to_rfc3339();

    loop {
        let json = serialize(&MetadataDoc {
            id,
            source_type: record.source_type,
            source_id: &record.source_id,
            updated_at: updated_at.clone(),
            access: &record.access_descriptor,
            content: &content,
            attributes: &attributes,
        })?;

        if json.len() <= budget.max_bytes {
            return Ok(TruncatedMetadata {
                json,
                content,
                truncated,
            });
        }

        // Removing a byte of raw text removes at least one byte of JSON.
        let overflow = json.len() - budget.max_bytes;
        truncated = true;

        let longest_attr = attributes
            .iter()
            .filter_map(|(k, v)| match v {
                AttrValue::Text(t) if !t.is_empty() => Some((k.clone(), t.len())),
                _ => None,
            })
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

        if let Some((key, len)) = longest_attr {
            if let Some(AttrValue::Text(text)) = attributes.get_mut(&key) {
                *text = take_bytes(text, len.saturating_sub(overflow));
            }
            continue;
        }

        if !content.is_empty() {
            content = take_bytes(&content, content.len().saturating_sub(overflow));
            continue;
        }

        if attributes.pop_last().is_some() {
            continue;
        }

        return Err(SyncError::MetadataOverBudget {
            source_id: record.source_id.clone(),
            size: json.len(),
            limit: budget.max_bytes,
        });
    }
}
