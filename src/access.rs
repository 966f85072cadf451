//! Access policy resolvers.
//!
//! [`StaticResolver`] reads the caller directory from `[access.principals]`.
//! [`CachedResolver`] wraps any resolver with a TTL cache so a directory
//! lookup is not repeated for every query. Expired entries are pruned on
//! every insert, so the cache holds at most the callers seen within one TTL.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use sync_harness_core::access::{AccessPolicyResolver, CallerScopes};

use crate::config::AccessConfig;

/// Caller directory from configuration.
///
/// An identity missing from the table resolves to no scopes: it still sees
/// public entries and entries that name it directly.
pub struct StaticResolver {
    principals: BTreeMap<String, Vec<String>>,
}

impl StaticResolver {
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            principals: config.principals.clone(),
        }
    }
}

#[async_trait]
impl AccessPolicyResolver for StaticResolver {
    async fn resolve_caller_scopes(&self, identity: &str) -> Result<CallerScopes> {
        Ok(CallerScopes {
            scope_keys: self
                .principals
                .get(identity)
                .map(|scopes| scopes.iter().cloned().collect())
                .unwrap_or_default(),
            principal_id: identity.to_string(),
        })
    }
}

pub struct CachedResolver<R> {
    inner: R,
    ttl: Duration,
    cache: RwLock<HashMap<String, (Instant, CallerScopes)>>,
}

impl<R: AccessPolicyResolver> CachedResolver<R> {
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<R: AccessPolicyResolver> AccessPolicyResolver for CachedResolver<R> {
    async fn resolve_caller_scopes(&self, identity: &str) -> Result<CallerScopes> {
        if let Some((at, scopes)) = self.cache.read().await.get(identity) {
            if at.elapsed() < self.ttl {
                return Ok(scopes.clone());
            }
        }

        let scopes = self.inner.resolve_caller_scopes(identity).await?;
        debug!(identity, scopes = scopes.scope_keys.len(), "Resolved caller scopes");
        let mut cache = self.cache.write().await;
        cache.retain(|_, (at, _)| at.elapsed() < self.ttl);
        cache.insert(identity.to_string(), (Instant::now(), scopes.clone()));
        Ok(scopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AccessPolicyResolver for Counting {
        async fn resolve_caller_scopes(&self, identity: &str) -> Result<CallerScopes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CallerScopes {
                scope_keys: ["projectX".to_string()].into_iter().collect(),
                principal_id: identity.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn static_resolver_reads_config() {
        let mut config = AccessConfig::default();
        config
            .principals
            .insert("alice".into(), vec!["projectX".into(), "ops".into()]);
        let resolver = StaticResolver::new(&config);

        let alice = resolver.resolve_caller_scopes("alice").await.unwrap();
        assert_eq!(alice.scope_keys.len(), 2);
        assert_eq!(alice.principal_id, "alice");

        let bob = resolver.resolve_caller_scopes("bob").await.unwrap();
        assert!(bob.scope_keys.is_empty());
        assert_eq!(bob.principal_id, "bob");
    }

    #[tokio::test]
    async fn cache_serves_within_ttl() {
        let cached = CachedResolver::new(
            Counting {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(3600),
        );
        cached.resolve_caller_scopes("alice").await.unwrap();
        cached.resolve_caller_scopes("alice").await.unwrap();
        cached.resolve_caller_scopes("bob").await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_insert() {
        let cached = CachedResolver::new(
            Counting {
                calls: AtomicUsize::new(0),
            },
            Duration::from_millis(20),
        );
        for caller in ["alice", "bob", "carol"] {
            cached.resolve_caller_scopes(caller).await.unwrap();
        }
        assert_eq!(cached.cache.read().await.len(), 3);

        tokio::time::sleep(Duration::from_millis(40)).await;
        cached.resolve_caller_scopes("dave").await.unwrap();
        let cache = cached.cache.read().await;
        assert_eq!(cache.len(), 1);
        assert!(cache.contains_key("dave"));
    }

    #[tokio::test]
    async fn zero_ttl_always_refreshes() {
        let cached = CachedResolver::new(
            Counting {
                calls: AtomicUsize::new(0),
            },
            Duration::ZERO,
        );
        cached.resolve_caller_scopes("alice").await.unwrap();
        cached.resolve_caller_scopes("alice").await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }
}
