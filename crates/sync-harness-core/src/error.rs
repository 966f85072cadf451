//! Error taxonomy for the ingestion pipeline.
//!
//! Application code propagates `anyhow::Error` like the rest of the crate
//! family; anything that needs a retry decision projects the error onto an
//! [`ErrorClass`] with [`classify`].

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::models::SourceType;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Timeout, rate limit, or 5xx from an upstream system.
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    /// Auth failure or malformed upstream response.
    #[error("upstream permanent failure: {0}")]
    UpstreamPermanent(String),

    #[error("pagination stalled for {source_type}/{partition_key}: {detail}")]
    PaginationStalled {
        source_type: SourceType,
        partition_key: String,
        detail: String,
    },

    #[error("cache corruption in batch {batch}: {detail}")]
    CacheCorruption { batch: String, detail: String },

    #[error(
        "persistence verification failed: attempted {attempted}, reported {reported}, \
         {missing} of {sampled} sampled ids missing and {stale} stale on read-back"
    )]
    PersistenceVerificationFailed {
        attempted: usize,
        reported: usize,
        sampled: usize,
        missing: usize,
        /// Sampled ids still holding an older version after the write.
        stale: usize,
    },

    #[error("task lost: {0}")]
    TaskLost(String),

    #[error("cycle exceeded its {budget_secs}s budget")]
    Timeout { budget_secs: u64 },

    #[error("metadata for {source_id} is {size} bytes after truncation (limit {limit})")]
    MetadataOverBudget {
        source_id: String,
        size: usize,
        limit: usize,
    },

    #[error("index write failed: {0}")]
    IndexWrite(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::UpstreamTransient(_) => ErrorClass::UpstreamTransient,
            SyncError::UpstreamPermanent(_) => ErrorClass::UpstreamPermanent,
            SyncError::PaginationStalled { .. } => ErrorClass::PaginationStalled,
            SyncError::CacheCorruption { .. } => ErrorClass::CacheCorruption,
            SyncError::PersistenceVerificationFailed { .. } => {
                ErrorClass::PersistenceVerificationFailed
            }
            SyncError::TaskLost(_) => ErrorClass::TaskLost,
            SyncError::Timeout { .. } => ErrorClass::Timeout,
            SyncError::MetadataOverBudget { .. } => ErrorClass::MetadataOverBudget,
            SyncError::IndexWrite(_) => ErrorClass::Storage,
        }
    }
}

/// Coarse error class used by the retry policy and the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    UpstreamTransient,
    UpstreamPermanent,
    PaginationStalled,
    CacheCorruption,
    PersistenceVerificationFailed,
    TaskLost,
    Timeout,
    MetadataOverBudget,
    /// Local storage or otherwise unclassified failure.
    Storage,
}

impl ErrorClass {
    /// Whether a failed cycle of this class goes back to `Pending`.
    ///
    /// Permanent upstream failures, stalled pagination, corrupt batches, and
    /// oversized identity metadata need a human; retrying them only repeats
    /// the failure.
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorClass::UpstreamTransient
            | ErrorClass::PersistenceVerificationFailed
            | ErrorClass::TaskLost
            | ErrorClass::Timeout
            | ErrorClass::Storage => true,
            ErrorClass::UpstreamPermanent
            | ErrorClass::PaginationStalled
            | ErrorClass::CacheCorruption
            | ErrorClass::MetadataOverBudget => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::UpstreamTransient => "upstream_transient",
            ErrorClass::UpstreamPermanent => "upstream_permanent",
            ErrorClass::PaginationStalled => "pagination_stalled",
            ErrorClass::CacheCorruption => "cache_corruption",
            ErrorClass::PersistenceVerificationFailed => "persistence_verification_failed",
            ErrorClass::TaskLost => "task_lost",
            ErrorClass::Timeout => "timeout",
            ErrorClass::MetadataOverBudget => "metadata_over_budget",
            ErrorClass::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "upstream_transient" => ErrorClass::UpstreamTransient,
            "upstream_permanent" => ErrorClass::UpstreamPermanent,
            "pagination_stalled" => ErrorClass::PaginationStalled,
            "cache_corruption" => ErrorClass::CacheCorruption,
            "persistence_verification_failed" => ErrorClass::PersistenceVerificationFailed,
            "task_lost" => ErrorClass::TaskLost,
            "timeout" => ErrorClass::Timeout,
            "metadata_over_budget" => ErrorClass::MetadataOverBudget,
            "storage" => ErrorClass::Storage,
            other => bail!("Unknown error class: '{}'", other),
        })
    }
}

/// Find the [`SyncError`] anywhere in the context chain and return its class.
///
/// Errors that carry no taxonomy entry (SQLite, I/O) are [`ErrorClass::Storage`].
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    err.chain()
        .find_map(|e| e.downcast_ref::<SyncError>())
        .map(SyncError::class)
        .unwrap_or(ErrorClass::Storage)
}
