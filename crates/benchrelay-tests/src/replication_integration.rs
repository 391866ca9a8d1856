//! Fan-out, per-follower ordering and delivery idempotency.

use crate::harness::{sample_doc, sample_doc_id, wait_until, RelayCluster, SAMPLE_INDEX};
use benchrelay_repl::WorkerState;
use benchrelay_store::StoreError;
use std::time::Duration;

#[tokio::test]
async fn test_documents_fan_out_to_every_follower() {
    let cluster = RelayCluster::start(3);

    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    cluster.coordinator.ingest(&sample_doc(2)).await.unwrap();
    assert!(cluster.wait_drained().await);

    for follower in &cluster.followers {
        assert_eq!(follower.doc_count(SAMPLE_INDEX).await, 2);
        assert_eq!(
            follower.document(SAMPLE_INDEX, &sample_doc_id(1)).await,
            cluster.leader.document(SAMPLE_INDEX, &sample_doc_id(1)).await
        );
    }
}

#[tokio::test]
async fn test_updates_to_one_document_apply_in_order() {
    let cluster = RelayCluster::start(1);
    let mut v1 = sample_doc(1);
    v1["value"] = serde_json::json!({ "median": 1.0 });
    let mut v2 = sample_doc(1);
    v2["value"] = serde_json::json!({ "median": 2.0 });

    cluster.coordinator.ingest(&v1).await.unwrap();
    cluster.coordinator.ingest(&v2).await.unwrap();
    assert!(cluster.wait_drained().await);

    let stored = cluster.followers[0]
        .document(SAMPLE_INDEX, &sample_doc_id(1))
        .await
        .unwrap();
    assert_eq!(stored["value"]["median"], 2.0);
    assert_eq!(
        cluster.followers[0].applied_order().await,
        vec![sample_doc_id(1), sample_doc_id(1)]
    );
}

#[tokio::test]
async fn test_ambiguous_timeout_retries_idempotently() {
    let cluster = RelayCluster::start(1);
    cluster.followers[0]
        .fail_next_after_apply(StoreError::Timeout {
            msg: "scripted".into(),
        })
        .await;

    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert!(cluster.wait_drained().await);

    // The write applied before the timeout surfaced, so the retry re-put
    // the same id: applied twice, stored once.
    assert_eq!(
        cluster.followers[0].applied_order().await,
        vec![sample_doc_id(1), sample_doc_id(1)]
    );
    assert_eq!(cluster.followers[0].doc_count(SAMPLE_INDEX).await, 1);

    let status = cluster.coordinator.followers()[0].status().await;
    assert_eq!(status.retried_total, 1);
    assert_eq!(status.dead_lettered_total, 0);
}

#[tokio::test]
async fn test_followers_progress_independently() {
    let cluster = RelayCluster::start(2);
    cluster.followers[1].set_unreachable(true).await;

    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    cluster.coordinator.ingest(&sample_doc(2)).await.unwrap();

    assert!(
        wait_until(
            || async { cluster.followers[0].doc_count(SAMPLE_INDEX).await == 2 },
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(cluster.backlog(1), 2);

    cluster.followers[1].set_unreachable(false).await;
    assert!(cluster.wait_drained().await);
    assert_eq!(cluster.followers[1].doc_count(SAMPLE_INDEX).await, 2);
}

#[tokio::test]
async fn test_unreachable_follower_pauses_without_burning_attempts() {
    let cluster = RelayCluster::start(1);
    cluster.followers[0].set_unreachable(true).await;
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();

    let worker = &cluster.coordinator.followers()[0];
    assert!(
        wait_until(
            || async { worker.status().await.state == WorkerState::Paused },
            Duration::from_secs(5)
        )
        .await
    );

    // An outage much longer than the retry ceiling's worth of attempts;
    // the task must still be pending when the follower returns.
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.followers[0].set_unreachable(false).await;

    assert!(cluster.wait_drained().await);
    let status = worker.status().await;
    assert_eq!(status.dead_lettered_total, 0);
    assert_eq!(cluster.followers[0].doc_count(SAMPLE_INDEX).await, 1);
}

#[tokio::test]
async fn test_lag_report_reflects_backlog() {
    let cluster = RelayCluster::start(1);
    cluster.followers[0].set_unreachable(true).await;
    for n in 1..=3 {
        cluster.coordinator.ingest(&sample_doc(n)).await.unwrap();
    }

    let report = cluster.coordinator.lag_report().await;
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].follower_id, "dc2");
    assert_eq!(report[0].backlog_depth, 3);
    assert!(report[0].oldest_pending_ms.is_some());
}
