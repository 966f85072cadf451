//! Caller-side access filtering.
//!
//! The query engine never decides who a caller is. An external
//! [`AccessPolicyResolver`] turns an identity into [`CallerScopes`], and the
//! engine pushes the resulting [`AccessFilter`] down into every index lookup.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{AccessDescriptor, Visibility};

/// What the resolver knows about a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerScopes {
    pub scope_keys: BTreeSet<String>,
    pub principal_id: String,
}

/// Resolves a caller identity to the scopes it may read.
///
/// Implementations live outside the core crate (config tables, directory
/// services). Callers are expected to cache results with a bounded TTL.
#[async_trait]
pub trait AccessPolicyResolver: Send + Sync {
    async fn resolve_caller_scopes(&self, identity: &str) -> Result<CallerScopes>;
}

/// Predicate applied to every candidate before it can be returned.
///
/// `visibility == public OR scope_key ∈ scopes OR principal ∈ principal_list
/// OR principal == owner`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessFilter {
    pub principal: String,
    pub scopes: BTreeSet<String>,
}

impl AccessFilter {
    pub fn new(principal: impl Into<String>, scopes: impl IntoIterator<Item = String>) -> Self {
        Self {
            principal: principal.into(),
            scopes: scopes.into_iter().collect(),
        }
    }

    /// A filter that matches only public entries.
    pub fn public_only() -> Self {
        Self::default()
    }

    pub fn allows(&self, access: &AccessDescriptor) -> bool {
        if access.visibility == Visibility::Public {
            return true;
        }
        if let Some(scope) = &access.scope_key {
            if self.scopes.contains(scope) {
                return true;
            }
        }
        if self.principal.is_empty() {
            return false;
        }
        access.principal_list.iter().any(|p| p == &self.principal)
            || access.owner.as_deref() == Some(self.principal.as_str())
    }
}

impl From<CallerScopes> for AccessFilter {
    fn from(scopes: CallerScopes) -> Self {
        Self {
            principal: scopes.principal_id,
            scopes: scopes.scope_keys,
        }
    }
}
