//! Ingest path: validation, leader writes, receipts and batch semantics.

use crate::harness::{
    fast_coordinator_config, sample_doc, sample_doc_at, sample_doc_id, RelayCluster, SAMPLE_INDEX,
};
use benchrelay_repl::ReplError;
use benchrelay_store::StoreError;
use serde_json::json;

#[tokio::test]
async fn test_ingest_lands_on_leader_with_defaults_applied() {
    let cluster = RelayCluster::start(1);

    let receipt = cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert_eq!(receipt.doc_id, sample_doc_id(1));
    assert_eq!(receipt.index, SAMPLE_INDEX);
    assert_eq!(receipt.followers_enqueued, 1);

    let stored = cluster
        .leader
        .document(SAMPLE_INDEX, &sample_doc_id(1))
        .await
        .unwrap();
    assert_eq!(stored["active"], true);
    assert_eq!(stored["environment"], "nightly");
    assert_eq!(stored["workload"], "geonames");
    assert_eq!(stored["value"]["median"], 1001.0);
    assert_eq!(stored["value"]["unit"], "docs/s");
}

#[tokio::test]
async fn test_reingest_same_identity_overwrites_in_place() {
    let cluster = RelayCluster::start(0);

    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();

    assert_eq!(cluster.leader.doc_count(SAMPLE_INDEX).await, 1);
}

#[tokio::test]
async fn test_invalid_document_reaches_no_store() {
    let cluster = RelayCluster::start(1);
    let mut doc = sample_doc(1);
    doc.as_object_mut().unwrap().remove("value");

    let err = cluster.coordinator.ingest(&doc).await.unwrap_err();
    match err {
        ReplError::Schema(e) => assert_eq!(e.field, "value"),
        other => panic!("expected schema error, got {other:?}"),
    }

    assert_eq!(cluster.leader.doc_count("benchmark-results-*").await, 0);
    assert_eq!(cluster.backlog(0), 0);
}

#[tokio::test]
async fn test_leader_rejection_fails_caller_and_skips_fanout() {
    let cluster = RelayCluster::start(1);
    cluster
        .leader
        .fail_next(StoreError::Rejected {
            status: 400,
            reason: "mapper_parsing_exception".into(),
        })
        .await;

    let err = cluster.coordinator.ingest(&sample_doc(1)).await.unwrap_err();
    assert!(matches!(
        err,
        ReplError::Store(StoreError::Rejected { status: 400, .. })
    ));
    assert_eq!(cluster.backlog(0), 0);
    assert_eq!(cluster.followers[0].doc_count("benchmark-results-*").await, 0);
}

#[tokio::test]
async fn test_leader_transient_failure_retried_within_call() {
    let cluster = RelayCluster::start(0);
    cluster
        .leader
        .fail_next(StoreError::Unreachable {
            msg: "connection refused".into(),
        })
        .await;

    let receipt = cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert_eq!(receipt.doc_id, sample_doc_id(1));
    assert_eq!(cluster.leader.doc_count(SAMPLE_INDEX).await, 1);
}

#[tokio::test]
async fn test_follower_outage_does_not_fail_ingest() {
    let cluster = RelayCluster::start(1);
    cluster.followers[0].set_unreachable(true).await;

    let receipt = cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert_eq!(receipt.followers_enqueued, 1);
    assert_eq!(cluster.leader.doc_count(SAMPLE_INDEX).await, 1);
}

#[tokio::test]
async fn test_default_environment_fills_missing_field() {
    let mut config = fast_coordinator_config();
    config.default_environment = Some("ci".to_string());
    let cluster = RelayCluster::start_with_config(0, config);

    let mut doc = sample_doc(1);
    doc.as_object_mut().unwrap().remove("environment");
    cluster.coordinator.ingest(&doc).await.unwrap();
    let stored = cluster
        .leader
        .document(SAMPLE_INDEX, &sample_doc_id(1))
        .await
        .unwrap();
    assert_eq!(stored["environment"], "ci");

    // An explicit value wins over the default.
    cluster.coordinator.ingest(&sample_doc(2)).await.unwrap();
    let stored = cluster
        .leader
        .document(SAMPLE_INDEX, &sample_doc_id(2))
        .await
        .unwrap();
    assert_eq!(stored["environment"], "nightly");
}

#[tokio::test]
async fn test_unknown_fields_become_labels() {
    let cluster = RelayCluster::start(0);
    let mut doc = sample_doc(1);
    let obj = doc.as_object_mut().unwrap();
    obj.insert("car".into(), json!("4gheap"));
    obj.insert("shard-count".into(), json!(5));

    cluster.coordinator.ingest(&doc).await.unwrap();

    let stored = cluster
        .leader
        .document(SAMPLE_INDEX, &sample_doc_id(1))
        .await
        .unwrap();
    assert_eq!(stored["car"], "4gheap");
    assert_eq!(stored["shard-count"], "5");
}

#[tokio::test]
async fn test_batch_is_all_or_nothing() {
    let cluster = RelayCluster::start(1);
    let mut bad = sample_doc(3);
    bad.as_object_mut().unwrap().remove("name");
    let docs = vec![sample_doc(1), bad, sample_doc(2)];

    let err = cluster.coordinator.ingest_batch(&docs).await.unwrap_err();
    assert!(matches!(err, ReplError::Schema(_)));
    assert_eq!(cluster.leader.doc_count("benchmark-results-*").await, 0);
    assert_eq!(cluster.backlog(0), 0);

    let docs = vec![sample_doc(1), sample_doc(2)];
    let receipt = cluster.coordinator.ingest_batch(&docs).await.unwrap();
    assert_eq!(receipt.accepted, 2);
    assert_eq!(receipt.followers_enqueued, 2);

    assert!(cluster.wait_drained().await);
    assert_eq!(cluster.followers[0].doc_count(SAMPLE_INDEX).await, 2);
}

#[tokio::test]
async fn test_batch_groups_span_months() {
    let cluster = RelayCluster::start(0);
    let docs = vec![sample_doc(1), sample_doc_at("20250219T100000Z", 2)];

    let receipt = cluster.coordinator.ingest_batch(&docs).await.unwrap();
    assert_eq!(receipt.accepted, 2);
    assert_eq!(cluster.leader.doc_count("benchmark-results-2025-01").await, 1);
    assert_eq!(cluster.leader.doc_count("benchmark-results-2025-02").await, 1);
}

#[tokio::test]
async fn test_empty_batch_is_a_no_op() {
    let cluster = RelayCluster::start(1);

    let receipt = cluster.coordinator.ingest_batch(&[]).await.unwrap();
    assert_eq!(receipt.accepted, 0);
    assert_eq!(receipt.followers_enqueued, 0);
}
