//! Operational surface: per-source health, manual triggers, cache sweeps.
//!
//! Health is derived from persisted state only (the watermark row and the
//! latest finished task), so `shx status` and `GET /status` agree with
//! whatever the workers last committed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use sync_harness_core::error::ErrorClass;
use sync_harness_core::models::SourceType;

use crate::config::Config;
use crate::fetch_cache::BatchCounts;
use crate::queue::{EnqueueOutcome, Task, TaskKind, TaskStatus};
use crate::schedule::ingest_job_name;
use crate::services::Services;
use crate::sqlite_index::SqliteIndex;
use crate::sync_state::WatermarkRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Stale,
    Failed,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "healthy",
            Health::Stale => "stale",
            Health::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_type: SourceType,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub age_secs: Option<i64>,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    pub cache: BatchCounts,
}

/// Classify one source.
///
/// `failed` wins when the latest finished task failed after the last
/// commit; otherwise a missing or too-old watermark is `stale`.
pub fn assess(
    now: DateTime<Utc>,
    watermark: Option<&WatermarkRow>,
    latest: Option<&Task>,
    staleness_secs: u64,
) -> Health {
    let failed_since_commit = latest
        .filter(|t| t.status == TaskStatus::Failed)
        .and_then(|t| t.finished_at)
        .is_some_and(|finished| watermark.map_or(true, |wm| finished > wm.updated_at));
    if failed_since_commit {
        return Health::Failed;
    }
    match watermark {
        Some(wm) if (now - wm.last_sync_at).num_seconds() <= staleness_secs as i64 => {
            Health::Healthy
        }
        _ => Health::Stale,
    }
}

pub async fn source_health(services: &Services, now: DateTime<Utc>) -> Result<Vec<SourceHealth>> {
    let watermarks = services.state.all().await?;
    let mut out = Vec::with_capacity(services.config.sources.len());

    for (source_type, source) in &services.config.sources {
        let watermark = watermarks.iter().find(|w| w.source_type == *source_type);
        let latest = services.queue.latest_terminal(*source_type).await?;
        let health = assess(now, watermark, latest.as_ref(), source.staleness_secs);
        let (last_error, error_class) = match (health, latest) {
            (Health::Failed, Some(task)) => (task.last_error, task.error_class),
            _ => (None, None),
        };
        out.push(SourceHealth {
            source_type: *source_type,
            last_sync_at: watermark.map(|w| w.last_sync_at),
            age_secs: watermark.map(|w| (now - w.last_sync_at).num_seconds()),
            health,
            last_error,
            error_class,
            cache: services.cache.counts(*source_type).await?,
        });
    }
    Ok(out)
}

/// Enqueue an out-of-schedule cycle. Returns the new task id.
pub async fn trigger(services: &Services, source_type: SourceType) -> Result<String> {
    services.config.source(source_type)?;
    services.connectors.get(source_type)?;
    let key = format!("manual:{}:{}", source_type, Uuid::new_v4());
    match services
        .queue
        .enqueue(
            &ingest_job_name(source_type),
            TaskKind::Ingest(source_type),
            &key,
            Utc::now(),
        )
        .await?
    {
        EnqueueOutcome::Enqueued(task_id) => Ok(task_id),
        EnqueueOutcome::Duplicate => anyhow::bail!("trigger key collision for {}", source_type),
    }
}

/// `shx status`
pub async fn run_status(config: Config) -> Result<()> {
    let services = Services::open(config).await?;
    let now = Utc::now();
    let rows = source_health(&services, now).await?;
    let counts = SqliteIndex::new(services.pool.clone())
        .count_by_source(&services.namespace)
        .await?;

    if rows.is_empty() {
        println!("No sources configured.");
        services.close().await;
        return Ok(());
    }

    println!(
        "{:<16} {:<8} {:<20} {:>10} {:>8} {:>8} {:>8}",
        "SOURCE", "HEALTH", "LAST SYNC", "AGE", "ENTRIES", "PENDING", "QUARANT"
    );
    for row in &rows {
        let entries = counts
            .iter()
            .find(|(st, _)| *st == row.source_type)
            .map_or(0, |(_, n)| *n);
        println!(
            "{:<16} {:<8} {:<20} {:>10} {:>8} {:>8} {:>8}",
            row.source_type.as_str(),
            row.health.as_str(),
            row.last_sync_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string()),
            row.age_secs.map(format_age).unwrap_or_else(|| "-".to_string()),
            entries,
            row.cache.pending,
            row.cache.quarantined,
        );
        if let Some(err) = &row.last_error {
            let class = row.error_class.map(|c| c.as_str()).unwrap_or("unknown");
            println!("    last error ({}): {}", class, err);
        }
    }

    services.close().await;
    Ok(())
}

/// `shx trigger <source>`
pub async fn run_trigger(config: Config, source_type: SourceType) -> Result<()> {
    let services = Services::open(config).await?;
    let task_id = trigger(&services, source_type).await?;
    println!("Enqueued {} cycle (task {})", source_type, task_id);
    services.close().await;
    Ok(())
}

/// `shx sweep`: drop archived batches beyond the retention window.
pub async fn run_sweep(config: Config, source_type: Option<SourceType>) -> Result<()> {
    let services = Services::open(config).await?;
    let keep = services.config.cache.retention_cycles;
    let deleted = services.cache.sweep(source_type, keep).await?;
    println!(
        "Swept {} archived batch(es), keeping the last {} cycle(s) per partition",
        deleted, keep
    );
    services.close().await;
    Ok(())
}

fn format_age(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs.max(0))
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}
