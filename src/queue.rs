//! Durable task queue on SQLite.
//!
//! Tasks move `pending → running → succeeded | failed`. A worker claims a
//! task with a lease; if the lease runs out before the worker reports back,
//! [`TaskQueue::reclaim_expired`] hands the task to someone else. Claiming
//! is a single `UPDATE ... RETURNING`, so two workers can never own the same
//! task, and a source with a live running task is never claimed twice.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sync_harness_core::error::ErrorClass;
use sync_harness_core::models::SourceType;

use crate::db::{from_millis, to_millis};

/// What a task does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "source_type", rename_all = "snake_case")]
pub enum TaskKind {
    Ingest(SourceType),
    RetentionSweep,
}

impl TaskKind {
    fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ingest(_) => "ingest",
            TaskKind::RetentionSweep => "retention_sweep",
        }
    }

    pub fn source_type(&self) -> Option<SourceType> {
        match self {
            TaskKind::Ingest(st) => Some(*st),
            TaskKind::RetentionSweep => None,
        }
    }

    fn from_columns(kind: &str, source_type: Option<&str>) -> Result<Self> {
        match (kind, source_type) {
            ("ingest", Some(st)) => Ok(TaskKind::Ingest(st.parse()?)),
            ("retention_sweep", _) => Ok(TaskKind::RetentionSweep),
            (other, st) => bail!("Unknown task kind '{}' (source_type {:?})", other, st),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Ingest(st) => write!(f, "ingest:{}", st),
            TaskKind::RetentionSweep => f.write_str("retention_sweep"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => TaskStatus::Pending,
            "running" => TaskStatus::Running,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            other => bail!("Unknown task status: '{}'", other),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: String,
    pub job: String,
    pub kind: TaskKind,
    pub dedupe_key: String,
    pub status: TaskStatus,
    /// Claims so far, including the current one.
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(String),
    /// A task with the same dedupe key already exists.
    Duplicate,
}

const TASK_COLUMNS: &str = "task_id, job, kind, source_type, dedupe_key, status, attempts, \
    available_at, lease_owner, lease_expires_at, last_error, error_class, created_at, finished_at";

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let kind: String = row.get("kind");
    let source_type: Option<String> = row.get("source_type");
    let status: String = row.get("status");
    let error_class: Option<String> = row.get("error_class");
    let attempts: i64 = row.get("attempts");
    Ok(Task {
        task_id: row.get("task_id"),
        job: row.get("job"),
        kind: TaskKind::from_columns(&kind, source_type.as_deref())?,
        dedupe_key: row.get("dedupe_key"),
        status: status.parse()?,
        attempts: attempts.max(0) as u32,
        available_at: from_millis(row.get("available_at"))?,
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row
            .get::<Option<i64>, _>("lease_expires_at")
            .map(from_millis)
            .transpose()?,
        last_error: row.get("last_error"),
        error_class: error_class.map(|c| c.parse()).transpose()?,
        created_at: from_millis(row.get("created_at"))?,
        finished_at: row
            .get::<Option<i64>, _>("finished_at")
            .map(from_millis)
            .transpose()?,
    })
}

#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
}

impl TaskQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a task unless one with `dedupe_key` already exists.
    pub async fn enqueue(
        &self,
        job: &str,
        kind: TaskKind,
        dedupe_key: &str,
        available_at: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let task_id = Uuid::new_v4().to_string();
        let now = to_millis(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (task_id, job, kind, source_type, dedupe_key, status, attempts,
                available_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            ON CONFLICT(dedupe_key) DO NOTHING
            "#,
        )
        .bind(&task_id)
        .bind(job)
        .bind(kind.as_str())
        .bind(kind.source_type().map(|st| st.as_str()))
        .bind(dedupe_key)
        .bind(to_millis(available_at))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(job, dedupe_key, "Task already enqueued");
            return Ok(EnqueueOutcome::Duplicate);
        }
        info!(job, dedupe_key, task_id = %task_id, "Enqueued task");
        Ok(EnqueueOutcome::Enqueued(task_id))
    }

    /// Claim the oldest available task for `worker`.
    ///
    /// Tasks for a source that already has a live running task are skipped,
    /// so at most one cycle per source runs at a time.
    pub async fn dequeue(
        &self,
        worker: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let now_ms = to_millis(now);
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET status = 'running', attempts = attempts + 1, lease_owner = ?,
                lease_expires_at = ?, updated_at = ?
            WHERE task_id = (
                SELECT t.task_id FROM tasks t
                WHERE t.status = 'pending' AND t.available_at <= ?
                  AND (t.source_type IS NULL OR NOT EXISTS (
                      SELECT 1 FROM tasks r
                      WHERE r.status = 'running' AND r.source_type = t.source_type
                        AND r.lease_expires_at > ?
                  ))
                ORDER BY t.available_at, t.created_at
                LIMIT 1
            ) AND status = 'pending'
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(worker)
        .bind(to_millis(now + lease))
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    /// Push the lease of a task `worker` still owns out to `until`.
    ///
    /// Fails (returns `false`) once the lease has expired, even before
    /// [`TaskQueue::reclaim_expired`] has run.
    pub async fn renew_lease(&self, task_id: &str, worker: &str, until: DateTime<Utc>) -> Result<bool> {
        let now = to_millis(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE tasks SET lease_expires_at = ?, updated_at = ?
            WHERE task_id = ? AND status = 'running' AND lease_owner = ? AND lease_expires_at > ?
            "#,
        )
        .bind(to_millis(until))
        .bind(now)
        .bind(task_id)
        .bind(worker)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark a task succeeded. Returns `false` when `worker` no longer owns
    /// it (the lease expired and the task was reclaimed).
    pub async fn complete(&self, task_id: &str, worker: &str) -> Result<bool> {
        let now = to_millis(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'succeeded', lease_owner = NULL, lease_expires_at = NULL,
                last_error = NULL, error_class = NULL, updated_at = ?, finished_at = ?
            WHERE task_id = ? AND status = 'running' AND lease_owner = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(task_id)
        .bind(worker)
        .execute(&self.pool)
        .await?;

        let owned = result.rows_affected() == 1;
        if !owned {
            warn!(task_id, worker, "Late completion ignored, task no longer leased by this worker");
        }
        Ok(owned)
    }

    /// Record a failure. With `retry_at` the task goes back to `pending`,
    /// otherwise it is permanently `failed`.
    pub async fn fail(
        &self,
        task_id: &str,
        worker: &str,
        error: &str,
        class: ErrorClass,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let now = to_millis(Utc::now());
        let result = match retry_at {
            Some(at) => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'pending', available_at = ?, lease_owner = NULL,
                        lease_expires_at = NULL, last_error = ?, error_class = ?, updated_at = ?
                    WHERE task_id = ? AND status = 'running' AND lease_owner = ?
                    "#,
                )
                .bind(to_millis(at))
                .bind(error)
                .bind(class.as_str())
                .bind(now)
                .bind(task_id)
                .bind(worker)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'failed', lease_owner = NULL, lease_expires_at = NULL,
                        last_error = ?, error_class = ?, updated_at = ?, finished_at = ?
                    WHERE task_id = ? AND status = 'running' AND lease_owner = ?
                    "#,
                )
                .bind(error)
                .bind(class.as_str())
                .bind(now)
                .bind(now)
                .bind(task_id)
                .bind(worker)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    /// Return running tasks with expired leases to `pending`, or fail them
    /// once `max_attempts` claims have been used.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>, max_attempts: u32) -> Result<u64> {
        let now_ms = to_millis(now);
        let mut tx = self.pool.begin().await?;

        let exhausted = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', lease_owner = NULL, lease_expires_at = NULL,
                last_error = 'lease expired', error_class = ?, updated_at = ?, finished_at = ?
            WHERE status = 'running' AND lease_expires_at <= ? AND attempts >= ?
            "#,
        )
        .bind(ErrorClass::TaskLost.as_str())
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(max_attempts as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', available_at = ?, lease_owner = NULL, lease_expires_at = NULL,
                last_error = 'lease expired', error_class = ?, updated_at = ?
            WHERE status = 'running' AND lease_expires_at <= ?
            "#,
        )
        .bind(now_ms)
        .bind(ErrorClass::TaskLost.as_str())
        .bind(now_ms)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        if exhausted + requeued > 0 {
            warn!(requeued, exhausted, "Reclaimed tasks with expired leases");
        }
        Ok(exhausted + requeued)
    }

    /// Whether `job` has a pending or running task.
    pub async fn has_open(&self, job: &str) -> Result<bool> {
        let open: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM tasks WHERE job = ? AND status IN ('pending', 'running')",
        )
        .bind(job)
        .fetch_one(&self.pool)
        .await?;
        Ok(open)
    }

    /// Most recently finished ingest task for `source_type`.
    pub async fn latest_terminal(&self, source_type: SourceType) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE source_type = ? AND kind = 'ingest' AND status IN ('succeeded', 'failed')
            ORDER BY finished_at DESC
            LIMIT 1
            "#
        ))
        .bind(source_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Most recent tasks, newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }
}
