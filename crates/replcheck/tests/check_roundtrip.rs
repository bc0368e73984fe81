//! End-to-end check flow across two in-memory nodes: the "primary" hashes a
//! range and builds descriptors, the "secondary" applies them through the
//! oplog dispatch path and reports outcomes to its health log.

use replcheck::config::CheckConfig;
use replcheck::core::{BatchRange, KeyBytes, Namespace, OpTime, Timestamp};
use replcheck::hasher::RangeHasher;
use replcheck::healthlog::{HealthLogSink, Severity};
use replcheck::oplog::{ApplyMode, BatchOplogEntry, CheckOplogEntry, SecondaryIndexCheckParameters};
use replcheck::store::memory::{MemoryCollection, MemoryEngine, MemoryHealthLog};
use replcheck::store::{Collection, DataThrottle, IndexKind};
use replcheck::verify::Checker;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn nss() -> Namespace {
    Namespace::parse("app.orders").unwrap()
}

fn make_node(docs: i64) -> (Arc<MemoryEngine>, Arc<MemoryCollection>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let engine = Arc::new(MemoryEngine::new());
    let coll = engine.create_collection(&nss(), false, false);
    coll.add_index("qty_1", "qty", IndexKind::Btree, false, None);
    for id in 1..=docs {
        coll.insert(json!({"_id": id, "qty": id % 4, "note": format!("order {id}")}))
            .unwrap();
    }
    (engine, coll)
}

/// Hash successive collection ranges as the sending node would, emitting one
/// descriptor per batch.
async fn build_batches(
    coll: &Arc<MemoryCollection>,
    params: SecondaryIndexCheckParameters,
    config: &CheckConfig,
) -> Vec<BatchOplogEntry> {
    let sink = Arc::new(MemoryHealthLog::new());
    let mut batches = Vec::new();
    let mut start = KeyBytes::min_sentinel();
    loop {
        let range = BatchRange::new(start.clone(), KeyBytes::max_sentinel());
        let mut hasher = RangeHasher::new(
            coll.clone() as Arc<dyn Collection>,
            range,
            Some(params.clone()),
            config,
            sink.clone() as Arc<dyn HealthLogSink>,
            DataThrottle::disabled(),
            CancellationToken::new(),
            None,
        )
        .unwrap();
        hasher.hash_collection_range().await.unwrap();
        if hasher.docs_seen() == 0 {
            break;
        }
        let end = hasher.last_key_seen().clone();
        batches.push(BatchOplogEntry {
            nss: nss(),
            batch_start: Some(start.clone()),
            batch_end: Some(end.clone()),
            min_key: None,
            max_key: None,
            md5: hasher.digest(),
            read_timestamp: Timestamp(100),
            batch_id: Some(uuid::Uuid::new_v4()),
            secondary_index_check_parameters: Some(params.clone()),
            log_batch_to_health_log: Some(true),
        });
        if end.is_max_sentinel() {
            break;
        }
        start = end;
    }
    batches
}

async fn apply_all(checker: &Checker, batches: &[BatchOplogEntry]) {
    for (i, batch) in batches.iter().enumerate() {
        // Descriptors travel as replicated documents; round-trip the wire
        // form to exercise the tagged encoding.
        let wire = serde_json::to_string(&CheckOplogEntry::Batch(batch.clone())).unwrap();
        let decoded: CheckOplogEntry = serde_json::from_str(&wire).unwrap();
        let optime = OpTime {
            ts: Timestamp(200 + i as u64),
            t: 1,
        };
        checker
            .apply_oplog_entry(&decoded, ApplyMode::Secondary, optime)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_identical_nodes_pass_multi_batch_check() {
    let (_pe, primary) = make_node(10);
    let (secondary_engine, _sc) = make_node(10);

    let config = CheckConfig {
        max_count: 4,
        ..CheckConfig::default()
    };
    let batches = build_batches(
        &primary,
        SecondaryIndexCheckParameters::data_consistency(),
        &config,
    )
    .await;
    assert_eq!(batches.len(), 3);

    let sink = Arc::new(MemoryHealthLog::new());
    let checker = Checker::new(secondary_engine, sink.clone(), config);
    apply_all(&checker, &batches).await;

    assert_eq!(checker.counters().batches_processed(), 3);
    assert_eq!(checker.counters().errors_recorded(), 0);
    let entries = sink.entries();
    assert_eq!(entries.len(), 3);
    assert!(entries
        .iter()
        .all(|e| e.severity == Severity::Info && e.msg == "batch consistent"));
}

#[tokio::test]
async fn test_single_byte_divergence_flags_only_its_batch() {
    let (_pe, primary) = make_node(10);
    let (secondary_engine, secondary) = make_node(10);
    // Same length, one byte different, in the third batch's range.
    secondary.corrupt_record(
        replcheck::core::RowId(9),
        serde_json::to_vec(&json!({"_id": 9, "qty": 2, "note": "order 9"})).unwrap(),
    );

    let config = CheckConfig {
        max_count: 4,
        ..CheckConfig::default()
    };
    let batches = build_batches(
        &primary,
        SecondaryIndexCheckParameters::data_consistency(),
        &config,
    )
    .await;

    let sink = Arc::new(MemoryHealthLog::new());
    let checker = Checker::new(secondary_engine, sink.clone(), config);
    apply_all(&checker, &batches).await;

    let entries = sink.entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.msg == "batch inconsistent")
            .count(),
        1
    );
    let bad = entries.iter().find(|e| e.msg == "batch inconsistent").unwrap();
    assert_eq!(bad.severity, Severity::Error);
    let data = bad.data.clone().unwrap();
    assert_ne!(data["md5"]["expected"], data["md5"]["found"]);
}

#[tokio::test]
async fn test_missing_index_keys_mode_reports_per_document() {
    let (_pe, primary) = make_node(6);
    let (secondary_engine, secondary) = make_node(6);
    secondary.remove_index_entries("qty_1", replcheck::core::RowId(3));

    let params = SecondaryIndexCheckParameters::missing_index_keys(
        replcheck::oplog::DocValidateMode::Default,
    );
    let config = CheckConfig::default();
    let batches = build_batches(&primary, params, &config).await;

    let sink = Arc::new(MemoryHealthLog::new());
    let checker = Checker::new(secondary_engine, sink.clone(), config);
    apply_all(&checker, &batches).await;

    let entries = sink.entries();
    // One finding for the document with the deleted entry, plus the batch
    // outcome. The digests still match: documents, not index keys, feed
    // the collection-range hash.
    assert!(entries
        .iter()
        .any(|e| e.msg == "document has missing index keys" && e.severity == Severity::Error));
    assert!(entries.iter().any(|e| e.msg == "batch consistent"));
}

#[tokio::test]
async fn test_extra_index_entry_flags_index_range_batch() {
    let (_pe, primary) = make_node(5);

    let secondary_engine = Arc::new(MemoryEngine::new());
    let secondary = secondary_engine.create_collection(&nss(), false, false);
    let secondary_index = secondary.add_index("qty_1", "qty", IndexKind::Btree, false, None);
    for id in 1..=5 {
        secondary
            .insert(json!({"_id": id, "qty": id % 4, "note": format!("order {id}")}))
            .unwrap();
    }

    let params = SecondaryIndexCheckParameters::extra_index_keys("qty_1");
    let range = BatchRange::full();
    let sink = Arc::new(MemoryHealthLog::new());
    let mut hasher = RangeHasher::new(
        primary.clone() as Arc<dyn Collection>,
        range.clone(),
        Some(params.clone()),
        &CheckConfig::default(),
        sink.clone() as Arc<dyn HealthLogSink>,
        DataThrottle::disabled(),
        CancellationToken::new(),
        None,
    )
    .unwrap();
    let index = primary.index("qty_1").unwrap();
    hasher.hash_index_key_range(index.as_ref()).await.unwrap();

    let batch = BatchOplogEntry {
        nss: nss(),
        batch_start: Some(range.start.clone()),
        batch_end: Some(range.end.clone()),
        min_key: None,
        max_key: None,
        md5: hasher.digest(),
        read_timestamp: Timestamp(100),
        batch_id: Some(uuid::Uuid::new_v4()),
        secondary_index_check_parameters: Some(params),
        log_batch_to_health_log: Some(true),
    };

    let verify_sink = Arc::new(MemoryHealthLog::new());
    let checker = Checker::new(secondary_engine, verify_sink.clone(), CheckConfig::default());

    checker
        .apply_oplog_entry(
            &CheckOplogEntry::Batch(batch.clone()),
            ApplyMode::Secondary,
            OpTime::default(),
        )
        .await
        .unwrap();
    assert_eq!(verify_sink.entries()[0].msg, "batch consistent");

    // Plant an index entry no document backs, then re-verify the same range.
    secondary_index.insert_raw_entry(
        KeyBytes::encode_value(&json!(99)).unwrap(),
        replcheck::core::RowId(77),
    );
    checker
        .apply_oplog_entry(
            &CheckOplogEntry::Batch(batch),
            ApplyMode::Secondary,
            OpTime::default(),
        )
        .await
        .unwrap();

    let entries = verify_sink.entries();
    assert_eq!(entries.last().unwrap().msg, "batch inconsistent");
    assert_eq!(entries.last().unwrap().severity, Severity::Error);
}

#[tokio::test]
async fn test_legacy_boundary_descriptors_still_apply() {
    let (_pe, primary) = make_node(3);
    let (secondary_engine, _sc) = make_node(3);

    let config = CheckConfig::default();
    let mut batches = build_batches(
        &primary,
        SecondaryIndexCheckParameters::data_consistency(),
        &config,
    )
    .await;
    assert_eq!(batches.len(), 1);

    // Rewrite the descriptor the way an old-version node would send it:
    // raw boundary `_id` values instead of pre-encoded keys.
    let batch = &mut batches[0];
    batch.batch_start = None;
    batch.batch_end = None;
    batch.min_key = Some(json!(0));
    batch.max_key = Some(json!(3));

    let sink = Arc::new(MemoryHealthLog::new());
    let checker = Checker::new(secondary_engine, sink.clone(), config);
    apply_all(&checker, &batches).await;

    assert_eq!(checker.counters().batches_processed(), 1);
    assert_eq!(sink.entries()[0].msg, "batch consistent");
}
