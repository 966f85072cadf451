//! Generic paginated JSON connector.
//!
//! Talks to any upstream (or an adapter in front of one) that serves:
//!
//! - `GET {base_url}/partitions` → `["ops", "payments"]`
//! - `GET {base_url}/partitions/{key}/records?since=<rfc3339>&limit=<n>[&cursor=<c>]`
//!   → `{"records": [...], "next_cursor": "...", "partition_access": {...}}`
//!
//! Records use the [`crate::wire`] shape. Retries are not done here: the
//! cycle runner retries transient fetch errors under its fetch policy.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;

use sync_harness_core::connector::{AccessHints, FetchPage, SourceConnector};
use sync_harness_core::error::SyncError;
use sync_harness_core::models::SourceType;

use crate::config::SourceConfig;
use crate::wire::{descriptor_resolution, WirePage, WireRecord};

pub struct HttpConnector {
    source_type: SourceType,
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    page_size: usize,
    fixed_partitions: Vec<String>,
}

impl HttpConnector {
    pub fn new(source_type: SourceType, config: &SourceConfig) -> Result<Self> {
        let base = config
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("sources.{}.base_url is required", source_type))?;
        let base_url = Url::parse(base)
            .map_err(|e| anyhow::anyhow!("sources.{}.base_url is invalid: {}", source_type, e))?;
        let token = match &config.token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                anyhow::anyhow!("{} environment variable not set (sources.{}.token_env)", var, source_type)
            })?),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            source_type,
            client,
            base_url,
            token,
            page_size: config.page_size,
            fixed_partitions: config.partitions.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SyncError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::UpstreamPermanent(format!("base url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        query: &[(&str, String)],
    ) -> Result<T, SyncError> {
        let mut request = self.client.get(url.clone()).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::UpstreamTransient(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("GET {} returned {}: {}", url, status, body);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                SyncError::UpstreamTransient(detail)
            } else {
                SyncError::UpstreamPermanent(detail)
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::UpstreamPermanent(format!("GET {}: malformed body: {}", url, e)))
    }
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum PartitionList {
    Bare(Vec<String>),
    Wrapped { partitions: Vec<String> },
}

#[async_trait]
impl SourceConnector for HttpConnector {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    fn describe(&self) -> String {
        format!("http {}", self.base_url)
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        if !self.fixed_partitions.is_empty() {
            return Ok(self.fixed_partitions.clone());
        }
        let url = self.endpoint(&["partitions"])?;
        let list: PartitionList = self.get_json(url, &[]).await?;
        Ok(match list {
            PartitionList::Bare(p) | PartitionList::Wrapped { partitions: p } => p,
        })
    }

    async fn fetch_changed_since(
        &self,
        partition: &str,
        since: DateTime<Utc>,
        cursor: Option<&str>,
    ) -> Result<FetchPage> {
        let url = self.endpoint(&["partitions", partition, "records"])?;
        let mut query = vec![
            ("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ("limit", self.page_size.to_string()),
        ];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }

        let page: WirePage = self.get_json(url, &query).await?;
        Ok(FetchPage {
            records: page.records.into_iter().map(WireRecord::into_raw).collect(),
            next_cursor: page.next_cursor.filter(|c| !c.is_empty()),
            access_hints: AccessHints {
                partition_default: descriptor_resolution(
                    page.partition_access,
                    "upstream sent no partition access",
                ),
            },
        })
    }
}
