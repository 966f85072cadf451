//! Schema migrations.
//!
//! Every statement is `CREATE ... IF NOT EXISTS`, so running migrations is
//! idempotent. Schema changes are additive: new tables, new indexes, new
//! nullable columns. Nothing is ever dropped.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Open the configured database, apply the schema, and close it.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Fetch cache: one row per fetched partition batch.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_batches (
            batch_id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            fetched_at INTEGER NOT NULL,
            record_count INTEGER NOT NULL,
            payload_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            cycle_id TEXT,
            ingested_at INTEGER,
            quarantine_reason TEXT,
            UNIQUE(source_type, partition_key, fetched_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Watermarks. partition_key '' is the per-source row.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            source_type TEXT NOT NULL,
            partition_key TEXT NOT NULL DEFAULT '',
            last_sync_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (source_type, partition_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable task queue.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            job TEXT NOT NULL,
            kind TEXT NOT NULL,
            source_type TEXT,
            dedupe_key TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            available_at INTEGER NOT NULL,
            lease_owner TEXT,
            lease_expires_at INTEGER,
            last_error TEXT,
            error_class TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            finished_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Search index entries.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_entries (
            namespace TEXT NOT NULL,
            id TEXT NOT NULL,
            source_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            sparse_terms TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            visibility TEXT NOT NULL,
            scope_key TEXT,
            owner TEXT,
            indexed_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entry_principals (
            namespace TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            principal TEXT NOT NULL,
            PRIMARY KEY (namespace, entry_id, principal)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='entries_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE entries_fts USING fts5(
                entry_id UNINDEXED,
                namespace UNINDEXED,
                terms
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_cache_batches_source_status ON cache_batches(source_type, status)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_status_available ON tasks(status, available_at)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_source_type ON tasks(source_type, status)",
        "CREATE INDEX IF NOT EXISTS idx_entries_scope ON index_entries(namespace, scope_key)",
        "CREATE INDEX IF NOT EXISTS idx_principals_principal ON entry_principals(namespace, principal)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
