//! # Sync Harness
//!
//! Scheduled, crash-safe ingestion of paginated upstream sources into a
//! permission-filtered hybrid search index.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────┐   ┌─────────────┐   ┌────────────┐
//! │ Scheduler │──▶│ Connectors  │──▶│ Fetch cache │──▶│  Pipeline  │
//! │ + workers │   │ fs / http   │   │  (SQLite)   │   │ embed+sink │
//! └───────────┘   └─────────────┘   └─────────────┘   └─────┬──────┘
//!                                                           │
//!                          ┌────────────────┬───────────────┤
//!                          ▼                ▼               ▼
//!                    ┌──────────┐    ┌────────────┐   ┌───────────┐
//!                    │  Index   │    │ Sync state │   │   Queue   │
//!                    │ FTS5+vec │    │ watermarks │   │  leases   │
//!                    └────┬─────┘    └────────────┘   └───────────┘
//!                         ▼
//!                  ┌──────────────┐
//!                  │ Hybrid query │◀── access resolver
//!                  └──────────────┘
//! ```
//!
//! The data model, error taxonomy, access filter, and query engine live in
//! `sync-harness-core`; this crate owns storage, connectors, scheduling,
//! and the `shx` binary.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`fetch_cache`] | Durable per-partition batch store |
//! | [`sync_state`] | Per-source watermarks |
//! | [`queue`] | Leased task queue |
//! | [`sqlite_index`] | `SearchIndex` over SQLite |
//! | [`pipeline`] | Embed, upsert, and verify cached batches |
//! | [`ingest`] | One sync cycle for one source |
//! | [`schedule`] / [`scheduler`] | Job schedules, beat, recovery, workers |
//! | [`connector_fs`] / [`connector_http`] / [`registry`] | Source connectors |
//! | [`access`] | Caller scope resolvers |
//! | [`status`] | Health, manual triggers, sweeps |
//! | [`server`] | Operational HTTP API |

pub mod access;
pub mod config;
pub mod connector_fs;
pub mod connector_http;
pub mod db;
pub mod embedding;
pub mod fetch_cache;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod services;
pub mod sources;
pub mod sqlite_index;
pub mod status;
pub mod sync_state;
pub mod wire;
