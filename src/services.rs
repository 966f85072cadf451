//! Shared handles for one open database.
//!
//! Every command, the worker pool, and the HTTP server work through a
//! [`Services`] value instead of global state: stores, the index, the
//! embedder, and the connector registry are built once and passed down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;

use sync_harness_core::access::AccessPolicyResolver;
use sync_harness_core::embedding::Embedder;
use sync_harness_core::index::{IndexNamespace, SearchIndex};
use sync_harness_core::search::HybridQueryEngine;

use crate::access::{CachedResolver, StaticResolver};
use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::fetch_cache::FetchCache;
use crate::migrate;
use crate::pipeline::IngestPipeline;
use crate::queue::TaskQueue;
use crate::registry::ConnectorRegistry;
use crate::sqlite_index::SqliteIndex;
use crate::sync_state::SyncStateStore;

pub struct Services {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub cache: FetchCache,
    pub state: SyncStateStore,
    pub queue: TaskQueue,
    pub index: Arc<dyn SearchIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub connectors: ConnectorRegistry,
    pub resolver: Arc<dyn AccessPolicyResolver>,
    pub namespace: IndexNamespace,
}

impl Services {
    /// Open the database, apply migrations, and build everything from config.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;
        let index: Arc<dyn SearchIndex> = Arc::new(SqliteIndex::new(pool.clone()));
        let embedder = create_embedder(&config.embedding)?;
        let connectors = ConnectorRegistry::from_config(&config)?;
        Self::assemble(config, pool, connectors, index, embedder)
    }

    /// Like [`Services::open`] with caller-supplied connectors, index, and embedder.
    pub async fn open_with(
        config: Config,
        connectors: ConnectorRegistry,
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;
        Self::assemble(config, pool, connectors, index, embedder)
    }

    fn assemble(
        config: Config,
        pool: SqlitePool,
        connectors: ConnectorRegistry,
        index: Arc<dyn SearchIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let namespace = config.index.namespace()?;
        let resolver = Arc::new(CachedResolver::new(
            StaticResolver::new(&config.access),
            Duration::from_secs(config.access.cache_ttl_secs),
        ));
        Ok(Self {
            cache: FetchCache::new(pool.clone()),
            state: SyncStateStore::new(pool.clone()),
            queue: TaskQueue::new(pool.clone()),
            config: Arc::new(config),
            pool,
            index,
            embedder,
            connectors,
            resolver,
            namespace,
        })
    }

    pub fn pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(
            Arc::clone(&self.index),
            Arc::clone(&self.embedder),
            self.namespace.clone(),
            self.config.index.budget(),
            self.config.index.verify_min_sample,
        )
    }

    pub fn query_engine(&self) -> HybridQueryEngine<dyn SearchIndex> {
        HybridQueryEngine::new(
            Arc::clone(&self.index),
            Arc::clone(&self.embedder),
            self.namespace.clone(),
            self.config.retrieval.params(),
        )
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
