//! JSON record shape shared by the built-in connectors.
//!
//! ```json
//! {
//!   "id": "PROJ-42",
//!   "text": "Payment gateway times out on retries",
//!   "updated_at": "2024-05-01T12:00:00Z",
//!   "access": { "visibility": "restricted", "scope_key": "projectX" },
//!   "attributes": { "status": "open", "priority": 2 }
//! }
//! ```
//!
//! `access` is optional. A record without one takes the partition default;
//! a record whose descriptor grants nobody is left unresolved.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use sync_harness_core::models::{AccessDescriptor, Attributes, RawRecord, Resolution};

#[derive(Debug, Clone, Deserialize)]
pub struct WireRecord {
    pub id: String,
    pub text: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub access: Option<AccessDescriptor>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl WireRecord {
    pub fn into_raw(self) -> RawRecord {
        RawRecord {
            access: descriptor_resolution(self.access, "record has no access descriptor"),
            source_id: self.id,
            content_text: self.text,
            updated_at: self.updated_at,
            attributes: self.attributes,
        }
    }
}

/// Page body returned by the HTTP connector's records endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct WirePage {
    #[serde(default)]
    pub records: Vec<WireRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    /// Descriptor for records that carry none.
    #[serde(default)]
    pub partition_access: Option<AccessDescriptor>,
}

pub fn descriptor_resolution(
    access: Option<AccessDescriptor>,
    missing_reason: &str,
) -> Resolution<AccessDescriptor> {
    match access {
        Some(descriptor) if descriptor.is_well_formed() => Resolution::Resolved(descriptor),
        Some(_) => Resolution::unresolved("restricted access descriptor grants nobody"),
        None => Resolution::unresolved(missing_reason),
    }
}
