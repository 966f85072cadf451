//! `shx search`: permission-filtered hybrid search from the command line.
//!
//! The caller identity goes through the configured access resolver; the
//! resulting filter is pushed into both index channels by the query engine.

use anyhow::{Context, Result};

use sync_harness_core::access::AccessFilter;
use sync_harness_core::search::ScoredResult;

use crate::config::Config;
use crate::services::Services;

/// Resolve `identity` (or none, meaning public entries only) to a filter.
pub async fn caller_filter(services: &Services, identity: Option<&str>) -> Result<AccessFilter> {
    match identity.map(str::trim).filter(|i| !i.is_empty()) {
        Some(identity) => {
            let scopes = services
                .resolver
                .resolve_caller_scopes(identity)
                .await
                .with_context(|| format!("resolving scopes for '{}'", identity))?;
            Ok(AccessFilter::from(scopes))
        }
        None => Ok(AccessFilter::public_only()),
    }
}

pub async fn search_as(
    services: &Services,
    query: &str,
    identity: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<ScoredResult>> {
    let filter = caller_filter(services, identity).await?;
    let top_k = limit.unwrap_or(services.config.retrieval.final_limit);
    let results = services.query_engine().search(query, &filter, top_k).await?;
    Ok(results)
}

pub async fn run_search(
    config: Config,
    query: &str,
    identity: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let services = Services::open(config).await?;
    let results = search_as(&services, query, identity, limit).await;
    services.close().await;
    let results = results?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.4}] {} / {}",
            i + 1,
            result.score,
            result.source_type,
            result.source_id
        );
        println!("    updated: {}", result.updated_at.format("%Y-%m-%d"));
        println!(
            "    ranks: dense {} / sparse {}",
            rank_label(result.dense_rank),
            rank_label(result.sparse_rank)
        );
        println!(
            "    excerpt: \"{}\"",
            result.content.replace('\n', " ").trim()
        );
        println!("    id: {}", result.id);
        println!();
    }
    Ok(())
}

fn rank_label(rank: Option<usize>) -> String {
    rank.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
}
