//! Sync cycle orchestration.
//!
//! One cycle for one source: read the watermark, list partitions, fetch
//! every partition that has no pending batch into the fetch cache, ingest
//! all pending batches, then archive them and advance the watermark. The
//! watermark moves only when every batch was upserted and verified; any
//! error leaves it where it was and the pending batches in place for the
//! next attempt.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use sync_harness_core::connector::{resolve_access, SourceConnector};
use sync_harness_core::error::{classify, ErrorClass, SyncError};
use sync_harness_core::models::{CacheBatch, Resolution, SourceRecord, SourceType};
use sync_harness_core::retry::{RetryDecision, RetryPolicy};

use crate::config::Config;
use crate::pipeline::IngestResult;
use crate::services::Services;

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub source_type: SourceType,
    pub attempt: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub partitions: usize,
    /// Partitions skipped because a pending batch was already cached.
    pub partitions_resumed: usize,
    pub records_fetched: usize,
    /// Records dropped because no access descriptor could be resolved.
    pub unresolved_access: usize,
    pub attempted: usize,
    pub upserted: usize,
    pub skipped: usize,
    pub watermark: DateTime<Utc>,
}

struct FetchedPartition {
    batch: CacheBatch,
    unresolved: usize,
}

/// Run `op`, retrying only [`ErrorClass::UpstreamTransient`] failures.
pub async fn with_fetch_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let class = classify(&err);
        if class != ErrorClass::UpstreamTransient {
            return Err(err);
        }
        match policy.decide(class, attempt) {
            RetryDecision::Retry { after } => {
                warn!(
                    what,
                    attempt,
                    delay_ms = after.as_millis() as u64,
                    error = %format!("{err:#}"),
                    "Transient upstream failure, retrying"
                );
                tokio::time::sleep(after).await;
            }
            RetryDecision::GiveUp => return Err(err),
        }
    }
}

/// Wall-clock budget for the next cycle of `source_type`.
pub async fn cycle_budget(services: &Services, source_type: SourceType) -> Result<Duration> {
    let source = services.config.source(source_type)?;
    let window_secs = match services.state.raw_watermark(source_type).await? {
        Some(wm) => (Utc::now() - wm).num_seconds(),
        None => source.lookback().num_seconds(),
    };
    Ok(source.cycle_budget(window_secs))
}

/// Run a cycle under its budget. Overrunning is a [`SyncError::Timeout`].
pub async fn run_cycle_bounded(
    services: &Services,
    source_type: SourceType,
    attempt: u32,
) -> Result<CycleReport> {
    let budget = cycle_budget(services, source_type).await?;
    match tokio::time::timeout(budget, run_cycle(services, source_type, attempt)).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            budget_secs: budget.as_secs(),
        }
        .into()),
    }
}

pub async fn run_cycle(
    services: &Services,
    source_type: SourceType,
    attempt: u32,
) -> Result<CycleReport> {
    let source = services.config.source(source_type)?;
    let connector = services.connectors.get(source_type)?;
    let policy = services.config.scheduler.fetch_policy();
    let cycle_id = Uuid::new_v4().to_string();
    let cycle_start = Utc::now();
    let since = services
        .state
        .get_watermark(source_type, source.lookback())
        .await?;

    info!(
        source_type = %source_type,
        cycle_id = %cycle_id,
        attempt,
        since = %since,
        "Sync cycle started"
    );

    let partitions = with_fetch_retry(&policy, "list partitions", || connector.partitions())
        .await
        .with_context(|| format!("listing partitions for {}", source_type))?;

    let mut resumed = 0usize;
    let mut fetched_records = 0usize;
    let mut unresolved = 0usize;
    let mut fetched_any = false;

    for partition in &partitions {
        if services.cache.already_fetched(source_type, partition).await? {
            resumed += 1;
            info!(source_type = %source_type, partition = %partition, "Partition already cached, resuming");
            continue;
        }
        if fetched_any {
            tokio::time::sleep(source.partition_delay()).await;
        }
        fetched_any = true;

        let fetched = fetch_partition(
            connector.as_ref(),
            source_type,
            partition,
            since,
            source.max_pages,
            &policy,
        )
        .await
        .with_context(|| format!("fetching {}/{}", source_type, partition))?;

        fetched_records += fetched.batch.records.len();
        unresolved += fetched.unresolved;
        services.cache.put(&fetched.batch).await?;
        info!(
            source_type = %source_type,
            partition = %partition,
            records = fetched.batch.records.len(),
            unresolved = fetched.unresolved,
            "Partition cached"
        );
    }

    let batches = services.cache.load_all(source_type).await?;
    let result: IngestResult = services.pipeline().ingest(&batches).await;

    if let Some(first) = result.errors.first() {
        for e in &result.errors {
            warn!(
                source_type = %source_type,
                batch_id = %e.batch_id,
                partition = %e.partition_key,
                source_id = e.source_id.as_deref().unwrap_or("-"),
                error = %e.error,
                "Ingest error"
            );
        }
        return Err(anyhow::Error::from(first.error.clone()).context(format!(
            "{} ingest error(s) in {} cycle {}; watermark not advanced",
            result.errors.len(),
            source_type,
            cycle_id
        )));
    }

    let commit_at = batches
        .iter()
        .map(|b| b.batch.fetched_at)
        .min()
        .unwrap_or(cycle_start);
    let batch_ids: Vec<String> = batches.iter().map(|b| b.batch_id.clone()).collect();
    services.cache.mark_ingested(&batch_ids, &cycle_id).await?;
    let watermark = services.state.commit(source_type, commit_at).await?;

    info!(
        source_type = %source_type,
        cycle_id = %cycle_id,
        batches = batches.len(),
        upserted = result.upserted,
        skipped = result.skipped,
        unresolved,
        watermark = %watermark,
        "Sync cycle committed"
    );

    Ok(CycleReport {
        cycle_id,
        source_type,
        attempt,
        window_start: since,
        window_end: cycle_start,
        partitions: partitions.len(),
        partitions_resumed: resumed,
        records_fetched: fetched_records,
        unresolved_access: unresolved,
        attempted: result.attempted,
        upserted: result.upserted,
        skipped: result.skipped,
        watermark,
    })
}

/// Page through one partition into a single batch.
///
/// Duplicate ids across pages keep the newest version. A repeated cursor,
/// a non-empty page with no unseen ids, or more than `max_pages` pages is
/// [`SyncError::PaginationStalled`].
async fn fetch_partition(
    connector: &dyn SourceConnector,
    source_type: SourceType,
    partition: &str,
    since: DateTime<Utc>,
    max_pages: usize,
    policy: &RetryPolicy,
) -> Result<FetchedPartition> {
    let fetched_at = Utc::now();
    let stalled = |detail: String| SyncError::PaginationStalled {
        source_type,
        partition_key: partition.to_string(),
        detail,
    };

    let mut records: Vec<SourceRecord> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_cursors: HashSet<String> = HashSet::new();
    let mut cursor: Option<String> = None;
    let mut unresolved = 0usize;
    let mut pages = 0usize;

    loop {
        pages += 1;
        if pages > max_pages {
            return Err(stalled(format!("more than {} pages", max_pages)).into());
        }

        let page = with_fetch_retry(policy, partition, || {
            connector.fetch_changed_since(partition, since, cursor.as_deref())
        })
        .await?;

        let mut unseen = 0usize;
        let page_len = page.records.len();
        for raw in &page.records {
            if seen_ids.insert(raw.source_id.clone()) {
                unseen += 1;
            }
            let access = match resolve_access(raw, &page.access_hints) {
                Resolution::Resolved(access) => access,
                Resolution::Unresolved { reason } => {
                    unresolved += 1;
                    warn!(
                        source_type = %source_type,
                        partition,
                        source_id = %raw.source_id,
                        reason = %reason,
                        "Access unresolved, record not indexed"
                    );
                    continue;
                }
            };
            let record = SourceRecord {
                source_id: raw.source_id.clone(),
                source_type,
                content_text: raw.content_text.clone(),
                updated_at: raw.updated_at,
                access_descriptor: access,
                attributes: raw.attributes.clone(),
            };
            match positions.get(&record.source_id) {
                Some(&i) if records[i].updated_at >= record.updated_at => {}
                Some(&i) => records[i] = record,
                None => {
                    positions.insert(record.source_id.clone(), records.len());
                    records.push(record);
                }
            }
        }

        if page_len > 0 && unseen == 0 {
            return Err(stalled(format!(
                "page {} repeated {} already-seen records",
                pages, page_len
            ))
            .into());
        }

        match page.next_cursor {
            None => break,
            Some(next) => {
                if !seen_cursors.insert(next.clone()) {
                    return Err(stalled(format!("cursor '{}' repeated", next)).into());
                }
                cursor = Some(next);
            }
        }
    }

    Ok(FetchedPartition {
        batch: CacheBatch {
            source_type,
            partition_key: partition.to_string(),
            records,
            fetched_at,
        },
        unresolved,
    })
}

/// `shx sync <source>`: run one cycle in the foreground and print a summary.
pub async fn run_sync(config: Config, sources: Vec<SourceType>) -> Result<()> {
    let services = Services::open(config).await?;
    let targets = if sources.is_empty() {
        services.config.sources.keys().copied().collect()
    } else {
        sources
    };
    if targets.is_empty() {
        anyhow::bail!("No sources configured. Add a [sources.<source_type>] section.");
    }

    let mut failed = 0usize;
    for source_type in targets {
        match run_cycle_bounded(&services, source_type, 1).await {
            Ok(report) => print_report(&report),
            Err(e) => {
                failed += 1;
                println!("sync {}", source_type);
                println!("  failed ({}): {:#}", classify(&e), e);
            }
        }
    }
    services.close().await;

    if failed > 0 {
        anyhow::bail!("{} source(s) failed to sync", failed);
    }
    println!("ok");
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!("sync {}", report.source_type);
    println!(
        "  window: {} → {}",
        report.window_start.to_rfc3339(),
        report.window_end.to_rfc3339()
    );
    println!(
        "  partitions: {} ({} resumed)",
        report.partitions, report.partitions_resumed
    );
    println!("  records fetched: {}", report.records_fetched);
    if report.unresolved_access > 0 {
        println!("  unresolved access (not indexed): {}", report.unresolved_access);
    }
    println!("  entries upserted: {}", report.upserted);
    println!("  unchanged skipped: {}", report.skipped);
    println!("  watermark: {}", report.watermark.to_rfc3339());
}
