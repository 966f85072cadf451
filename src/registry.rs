//! Connector registry.
//!
//! Maps each [`SourceType`] to the connector that fetches it. Built-in
//! connectors come from `[sources.*]` via [`ConnectorRegistry::from_config`];
//! embedders and tests add their own with [`ConnectorRegistry::register`].
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use sync_harness::registry::ConnectorRegistry;
//! # fn connector() -> Arc<dyn sync_harness_core::connector::SourceConnector> { unimplemented!() }
//! let mut connectors = ConnectorRegistry::new();
//! connectors.register(connector());
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use sync_harness_core::connector::SourceConnector;
use sync_harness_core::models::SourceType;

use crate::config::Config;
use crate::connector_fs::ExportDirConnector;
use crate::connector_http::HttpConnector;

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<SourceType, Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One connector per configured source.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (source_type, source) in &config.sources {
            let connector: Arc<dyn SourceConnector> = match source.connector.as_str() {
                "filesystem" => Arc::new(ExportDirConnector::new(*source_type, source)?),
                "http" => Arc::new(
                    HttpConnector::new(*source_type, source)
                        .with_context(|| format!("building http connector for {}", source_type))?,
                ),
                other => bail!("Unknown connector '{}' for sources.{}", other, source_type),
            };
            registry.register(connector);
        }
        Ok(registry)
    }

    /// Register a connector, replacing any existing one for its source type.
    pub fn register(&mut self, connector: Arc<dyn SourceConnector>) {
        self.connectors.insert(connector.source_type(), connector);
    }

    pub fn get(&self, source_type: SourceType) -> Result<Arc<dyn SourceConnector>> {
        self.connectors
            .get(&source_type)
            .cloned()
            .with_context(|| format!("No connector registered for source '{}'", source_type))
    }

    pub fn iter(&self) -> impl Iterator<Item = (SourceType, &Arc<dyn SourceConnector>)> {
        self.connectors.iter().map(|(st, c)| (*st, c))
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}
