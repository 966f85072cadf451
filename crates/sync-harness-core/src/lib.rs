//! # Sync Harness Core
//!
//! Runtime-agnostic logic for Sync Harness: the data model, the ingestion
//! error taxonomy, access filtering, metadata truncation, the index and
//! embedder traits, and the hybrid (dense + sparse) query engine.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Durable stores, connectors, and the
//! scheduler live in the `sync-harness` application crate.

pub mod access;
pub mod connector;
pub mod embedding;
pub mod error;
pub mod index;
pub mod metadata;
pub mod models;
pub mod retry;
pub mod search;
pub mod terms;
pub mod validate;
