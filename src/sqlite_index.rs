//! SQLite-backed [`SearchIndex`].
//!
//! Entries live in `index_entries` with the embedding stored as a
//! little-endian f32 BLOB; sparse terms are mirrored into the
//! `entries_fts` FTS5 table. Dense search is a brute-force cosine scan over
//! the rows that pass the access predicate; sparse search ranks FTS
//! matches by BM25. In both cases the access predicate is part of the SQL,
//! so rows the caller may not see are never loaded.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use sync_harness_core::access::AccessFilter;
use sync_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use sync_harness_core::index::{Candidate, EntryFingerprint, IndexNamespace, SearchIndex, UpsertAck};
use sync_harness_core::models::{AccessDescriptor, IndexEntry, SourceType, Visibility};

use crate::db::{from_millis, to_millis};

/// Bound on host parameters per `IN (...)` list.
const IN_CHUNK: usize = 400;

#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Entry counts per source type, for `shx status`.
    pub async fn count_by_source(&self, ns: &IndexNamespace) -> Result<Vec<(SourceType, i64)>> {
        let rows = sqlx::query(
            "SELECT source_type, COUNT(*) AS n FROM index_entries WHERE namespace = ? GROUP BY source_type ORDER BY source_type",
        )
        .bind(ns.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let st: String = row.get("source_type");
                Ok((st.parse()?, row.get::<i64, _>("n")))
            })
            .collect()
    }

    async fn load_principals(
        &self,
        ns: &IndexNamespace,
        ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for chunk in ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT entry_id, principal FROM entry_principals WHERE namespace = ",
            );
            qb.push_bind(ns.as_str());
            qb.push(" AND entry_id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.as_str());
            }
            qb.push(") ORDER BY entry_id, principal");
            for row in qb.build().fetch_all(&self.pool).await? {
                out.entry(row.get("entry_id"))
                    .or_default()
                    .push(row.get("principal"));
            }
        }
        Ok(out)
    }

    /// Attach principal lists to candidates loaded without them.
    async fn with_principals(
        &self,
        ns: &IndexNamespace,
        mut candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>> {
        let ids: Vec<String> = candidates.iter().map(|c| c.entry_id.clone()).collect();
        let mut principals = self.load_principals(ns, &ids).await?;
        for c in &mut candidates {
            if let Some(list) = principals.remove(&c.entry_id) {
                c.access.principal_list = list;
            }
        }
        Ok(candidates)
    }
}

/// `AND (<access predicate>)` over the `e` alias of `index_entries`.
fn push_access_predicate(qb: &mut QueryBuilder<'_, Sqlite>, filter: &AccessFilter) {
    qb.push(" AND (e.visibility = 'public'");
    if !filter.scopes.is_empty() {
        qb.push(" OR e.scope_key IN (");
        let mut sep = qb.separated(", ");
        for scope in &filter.scopes {
            sep.push_bind(scope.clone());
        }
        qb.push(")");
    }
    if !filter.principal.is_empty() {
        qb.push(" OR e.owner = ");
        qb.push_bind(filter.principal.clone());
        qb.push(
            " OR EXISTS (SELECT 1 FROM entry_principals p \
             WHERE p.namespace = e.namespace AND p.entry_id = e.id AND p.principal = ",
        );
        qb.push_bind(filter.principal.clone());
        qb.push(")");
    }
    qb.push(")");
}

fn candidate_from_row(row: &SqliteRow, raw_score: f64) -> Result<Candidate> {
    let source_type: String = row.get("source_type");
    let visibility: String = row.get("visibility");
    Ok(Candidate {
        entry_id: row.get("id"),
        raw_score,
        source_type: source_type.parse()?,
        source_id: row.get("source_id"),
        snippet: row.get("content"),
        updated_at: from_millis(row.get("updated_at"))?,
        access: AccessDescriptor {
            visibility: visibility.parse()?,
            scope_key: row.get("scope_key"),
            principal_list: Vec::new(),
            owner: row.get("owner"),
        },
    })
}

/// FTS5 query that matches any of the terms.
fn fts_query(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn upsert(&self, ns: &IndexNamespace, entries: &[IndexEntry]) -> Result<UpsertAck> {
        let now = to_millis(chrono::Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;

        for entry in entries {
            let access = &entry.access_descriptor;
            let result = sqlx::query(
                r#"
                INSERT INTO index_entries (namespace, id, source_type, source_id, content, content_hash,
                    updated_at, embedding, dims, sparse_terms, metadata_json, visibility, scope_key, owner, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(namespace, id) DO UPDATE SET
                    source_type = excluded.source_type,
                    source_id = excluded.source_id,
                    content = excluded.content,
                    content_hash = excluded.content_hash,
                    updated_at = excluded.updated_at,
                    embedding = excluded.embedding,
                    dims = excluded.dims,
                    sparse_terms = excluded.sparse_terms,
                    metadata_json = excluded.metadata_json,
                    visibility = excluded.visibility,
                    scope_key = excluded.scope_key,
                    owner = excluded.owner,
                    indexed_at = excluded.indexed_at
                "#,
            )
            .bind(ns.as_str())
            .bind(&entry.id)
            .bind(entry.source_type.as_str())
            .bind(&entry.source_id)
            .bind(&entry.content)
            .bind(&entry.content_hash)
            .bind(to_millis(entry.updated_at))
            .bind(vec_to_blob(&entry.embedding_vector))
            .bind(entry.embedding_vector.len() as i64)
            .bind(entry.sparse_terms.join(" "))
            .bind(&entry.metadata_json)
            .bind(access.visibility.as_str())
            .bind(&access.scope_key)
            .bind(&access.owner)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("upserting index entry {}", entry.id))?;
            written += result.rows_affected() as usize;

            sqlx::query("DELETE FROM entries_fts WHERE namespace = ? AND entry_id = ?")
                .bind(ns.as_str())
                .bind(&entry.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO entries_fts (entry_id, namespace, terms) VALUES (?, ?, ?)")
                .bind(&entry.id)
                .bind(ns.as_str())
                .bind(entry.sparse_terms.join(" "))
                .execute(&mut *tx)
                .await?;

            sqlx::query("DELETE FROM entry_principals WHERE namespace = ? AND entry_id = ?")
                .bind(ns.as_str())
                .bind(&entry.id)
                .execute(&mut *tx)
                .await?;
            for principal in &access.principal_list {
                sqlx::query(
                    "INSERT OR IGNORE INTO entry_principals (namespace, entry_id, principal) VALUES (?, ?, ?)",
                )
                .bind(ns.as_str())
                .bind(&entry.id)
                .bind(principal)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(UpsertAck { written })
    }

    async fn existing_ids(&self, ns: &IndexNamespace, ids: &[String]) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for chunk in ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT id FROM index_entries WHERE namespace = ");
            qb.push_bind(ns.as_str());
            qb.push(" AND id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.as_str());
            }
            qb.push(")");
            for row in qb.build().fetch_all(&self.pool).await? {
                found.push(row.get::<String, _>("id"));
            }
        }
        Ok(found)
    }

    async fn fingerprints(
        &self,
        ns: &IndexNamespace,
        ids: &[String],
    ) -> Result<HashMap<String, EntryFingerprint>> {
        let mut out = HashMap::new();
        for chunk in ids.chunks(IN_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, content_hash, updated_at FROM index_entries WHERE namespace = ",
            );
            qb.push_bind(ns.as_str());
            qb.push(" AND id IN (");
            let mut sep = qb.separated(", ");
            for id in chunk {
                sep.push_bind(id.as_str());
            }
            qb.push(")");
            for row in qb.build().fetch_all(&self.pool).await? {
                out.insert(
                    row.get::<String, _>("id"),
                    EntryFingerprint {
                        content_hash: row.get("content_hash"),
                        updated_at: from_millis(row.get("updated_at"))?,
                    },
                );
            }
        }
        Ok(out)
    }

    async fn dense_search(
        &self,
        ns: &IndexNamespace,
        query_vec: &[f32],
        filter: &AccessFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT e.id, e.source_type, e.source_id, e.content, e.updated_at, e.embedding, \
             e.visibility, e.scope_key, e.owner FROM index_entries e WHERE e.namespace = ",
        );
        qb.push_bind(ns.as_str());
        push_access_predicate(&mut qb, filter);

        let rows = qb.build().fetch_all(&self.pool).await?;

        // Compute cosine similarity in Rust
        let mut candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                candidate_from_row(row, similarity)
            })
            .collect::<Result<Vec<_>>>()?;

        candidates.sort_by(|a, b| {
            b.raw_score
                .total_cmp(&a.raw_score)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });
        candidates.truncate(limit);

        self.with_principals(ns, candidates).await
    }

    async fn sparse_search(
        &self,
        ns: &IndexNamespace,
        terms: &[String],
        filter: &AccessFilter,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT e.id, e.source_type, e.source_id, e.content, e.updated_at, \
             e.visibility, e.scope_key, e.owner, bm25(entries_fts) AS score \
             FROM entries_fts JOIN index_entries e \
             ON e.namespace = entries_fts.namespace AND e.id = entries_fts.entry_id \
             WHERE entries_fts MATCH ",
        );
        qb.push_bind(fts_query(terms));
        qb.push(" AND e.namespace = ");
        qb.push_bind(ns.as_str());
        push_access_predicate(&mut qb, filter);
        qb.push(" ORDER BY score, e.updated_at DESC, e.id LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let candidates = rows
            .iter()
            .map(|row| {
                let score: f64 = row.get("score");
                // bm25() is lower-is-better; negate so higher = better
                candidate_from_row(row, -score)
            })
            .collect::<Result<Vec<_>>>()?;

        self.with_principals(ns, candidates).await
    }

    async fn count(&self, ns: &IndexNamespace) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_entries WHERE namespace = ?")
            .bind(ns.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}
