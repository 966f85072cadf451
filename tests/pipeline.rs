mod common;

use std::sync::Arc;

use chrono::Utc;

use common::*;
use sync_harness::ingest::run_cycle;
use sync_harness::pipeline::IngestPipeline;
use sync_harness::search::search_as;
use sync_harness_core::connector::SourceConnector;
use sync_harness_core::embedding::HashEmbedder;
use sync_harness_core::error::{classify, ErrorClass, SyncError};
use sync_harness_core::index::memory::InMemoryIndex;
use sync_harness_core::index::SearchIndex;
use sync_harness_core::metadata::MetadataBudget;
use sync_harness_core::models::{
    entry_id, AccessDescriptor, Attributes, CacheBatch, SourceRecord, SourceType,
};

fn record(id: &str, text: &str) -> SourceRecord {
    SourceRecord {
        source_id: id.to_string(),
        source_type: SourceType::Meetings,
        content_text: text.to_string(),
        updated_at: minutes_ago(3),
        access_descriptor: AccessDescriptor::scoped("projectX"),
        attributes: Attributes::new(),
    }
}

fn batch(records: Vec<SourceRecord>) -> CacheBatch {
    CacheBatch {
        source_type: SourceType::Meetings,
        partition_key: "standup".to_string(),
        records,
        fetched_at: Utc::now(),
    }
}

#[tokio::test]
async fn reingesting_a_batch_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(InMemoryIndex::new());
    let services = open_services(
        test_config(&dir, &[SourceType::Meetings], ""),
        Vec::new(),
        index.clone(),
    )
    .await;

    services
        .cache
        .put(&batch(vec![
            record("t1", "quarterly planning transcript"),
            record("t2", "retro transcript"),
        ]))
        .await
        .unwrap();
    let stored = services.cache.load_all(SourceType::Meetings).await.unwrap();
    let pipeline = services.pipeline();

    let first = pipeline.ingest(&stored).await;
    assert!(first.is_clean());
    assert_eq!(first.upserted, 2);

    let second = pipeline.ingest(&stored).await;
    assert!(second.is_clean());
    assert_eq!(second.upserted, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(index.upsert_calls(), 1);
    assert_eq!(index.count(&services.namespace).await.unwrap(), 2);
}

#[tokio::test]
async fn duplicate_source_ids_are_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let services = open_services(
        test_config(&dir, &[SourceType::Meetings], ""),
        Vec::new(),
        Arc::new(InMemoryIndex::new()),
    )
    .await;

    let err = services
        .cache
        .put(&batch(vec![record("t1", "first"), record("t1", "second")]))
        .await
        .unwrap_err();
    assert_eq!(classify(&err), ErrorClass::CacheCorruption);

    let counts = services.cache.counts(SourceType::Meetings).await.unwrap();
    assert_eq!(counts.quarantined, 1);
    assert_eq!(counts.pending, 0);
    assert!(services
        .cache
        .load_all(SourceType::Meetings)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn acknowledged_but_missing_writes_fail_verification() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(ScriptedConnector::new(SourceType::Chat, &["general"]));
    connector.set_records("general", records("general", 30, minutes_ago(5)));
    let index = Arc::new(FaultyIndex::new(Fault::DropWrites));
    let services = open_services(
        test_config(&dir, &[SourceType::Chat], ""),
        vec![connector as Arc<dyn SourceConnector>],
        index.clone(),
    )
    .await;

    let err = run_cycle(&services, SourceType::Chat, 1).await.unwrap_err();
    assert_eq!(classify(&err), ErrorClass::PersistenceVerificationFailed);
    assert!(services
        .state
        .raw_watermark(SourceType::Chat)
        .await
        .unwrap()
        .is_none());
    assert_eq!(services.cache.counts(SourceType::Chat).await.unwrap().pending, 1);

    // Once the index stores what it acknowledges, the pending batch goes through.
    index.set_fault(Fault::None);
    let report = run_cycle(&services, SourceType::Chat, 2).await.unwrap();
    assert_eq!(report.upserted, 30);
    assert_eq!(report.partitions_resumed, 1);
}

#[tokio::test]
async fn oversized_identity_is_a_record_error() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(InMemoryIndex::new());
    let pipeline = IngestPipeline::new(
        index.clone(),
        Arc::new(HashEmbedder::new(32)),
        sync_harness_core::index::IndexNamespace::new("test").unwrap(),
        MetadataBudget {
            max_bytes: 512,
            max_field_chars: 64,
        },
        4,
    );
    let services = open_services(
        test_config(&dir, &[SourceType::Meetings], ""),
        Vec::new(),
        index.clone(),
    )
    .await;

    let long_id = "x".repeat(600);
    services
        .cache
        .put(&batch(vec![
            record("short", &"long transcript text ".repeat(200)),
            record(&long_id, "tiny"),
        ]))
        .await
        .unwrap();
    let stored = services.cache.load_all(SourceType::Meetings).await.unwrap();

    let result = pipeline.ingest(&stored).await;
    assert_eq!(result.upserted, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].source_id.as_deref(), Some(long_id.as_str()));
    assert!(matches!(
        result.errors[0].error,
        SyncError::MetadataOverBudget { limit: 512, .. }
    ));
}

fn versioned(
    id: &str,
    text: &str,
    updated_at: chrono::DateTime<Utc>,
    access: AccessDescriptor,
    fetched_at: chrono::DateTime<Utc>,
) -> CacheBatch {
    CacheBatch {
        source_type: SourceType::Meetings,
        partition_key: "standup".to_string(),
        records: vec![SourceRecord {
            source_id: id.to_string(),
            source_type: SourceType::Meetings,
            content_text: text.to_string(),
            updated_at,
            access_descriptor: access,
            attributes: Attributes::new(),
        }],
        fetched_at,
    }
}

#[tokio::test]
async fn permission_change_alone_rewrites_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let services = open_services(
        test_config(&dir, &[SourceType::Meetings], ""),
        Vec::new(),
        Arc::new(InMemoryIndex::new()),
    )
    .await;
    let pipeline = services.pipeline();
    let updated_at = minutes_ago(30);
    let text = "payment gateway incident review";

    let first_id = services
        .cache
        .put(&versioned("t1", text, updated_at, AccessDescriptor::public(), minutes_ago(2)))
        .await
        .unwrap();
    let stored = services.cache.load_all(SourceType::Meetings).await.unwrap();
    assert_eq!(pipeline.ingest(&stored).await.upserted, 1);
    services.cache.mark_ingested(&[first_id], "cycle-1").await.unwrap();
    assert_eq!(
        search_as(&services, "payment gateway", None, None).await.unwrap().len(),
        1
    );

    // Same text and timestamp, now restricted to projectY.
    services
        .cache
        .put(&versioned(
            "t1",
            text,
            updated_at,
            AccessDescriptor::scoped("projectY"),
            minutes_ago(1),
        ))
        .await
        .unwrap();
    let stored = services.cache.load_all(SourceType::Meetings).await.unwrap();
    let second = pipeline.ingest(&stored).await;
    assert!(second.is_clean());
    assert_eq!(second.upserted, 1);
    assert_eq!(second.skipped, 0);

    assert!(search_as(&services, "payment gateway", None, None)
        .await
        .unwrap()
        .is_empty());
    assert!(search_as(&services, "payment gateway", Some("alice"), None)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        search_as(&services, "payment gateway", Some("bob"), None)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn silently_dropped_overwrite_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(FaultyIndex::new(Fault::None));
    let services = open_services(
        test_config(&dir, &[SourceType::Meetings], ""),
        Vec::new(),
        index.clone(),
    )
    .await;
    let pipeline = services.pipeline();
    let access = AccessDescriptor::scoped("projectX");

    let v1 = services
        .cache
        .put(&versioned("t1", "v1 text", minutes_ago(30), access.clone(), minutes_ago(2)))
        .await
        .unwrap();
    let stored = services.cache.load_all(SourceType::Meetings).await.unwrap();
    assert!(pipeline.ingest(&stored).await.is_clean());
    services.cache.mark_ingested(&[v1], "cycle-1").await.unwrap();

    // The index acknowledges the overwrite but keeps the old row.
    index.set_fault(Fault::DropWrites);
    services
        .cache
        .put(&versioned("t1", "v2 text", minutes_ago(10), access, minutes_ago(1)))
        .await
        .unwrap();
    let stored = services.cache.load_all(SourceType::Meetings).await.unwrap();
    let result = pipeline.ingest(&stored).await;

    assert_eq!(result.upserted, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(matches!(
        result.errors[0].error,
        SyncError::PersistenceVerificationFailed {
            missing: 0,
            stale: 1,
            ..
        }
    ));
    let kept = index
        .inner
        .get(&services.namespace, &entry_id(SourceType::Meetings, "t1"))
        .unwrap()
        .unwrap();
    assert_eq!(kept.content, "v1 text");
}
