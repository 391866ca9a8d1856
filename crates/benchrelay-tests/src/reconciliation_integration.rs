//! Drift detection and repair between leader and followers.

use crate::harness::{
    sample_doc, sample_doc_at, sample_doc_id, wait_until, RelayCluster, SAMPLE_INDEX,
};
use benchrelay_model::parse_timestamp;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_clean_when_follower_caught_up() {
    let cluster = RelayCluster::start(1);
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    cluster.coordinator.ingest(&sample_doc(2)).await.unwrap();
    assert!(cluster.wait_drained().await);

    let auditor = cluster.auditor(false);
    let reports = auditor.run_once(false).await.unwrap();
    assert_eq!(reports.len(), 1);

    let report = &reports[0];
    assert!(report.clean());
    assert_eq!(report.follower_id, "dc2");
    assert_eq!(report.leader_count, 2);
    assert_eq!(report.follower_count, 2);
    assert_eq!(report.leader_checksum, report.follower_checksum);
    assert!(parse_timestamp(&report.window_end).is_some());
}

#[tokio::test]
async fn test_detects_missing_documents() {
    let cluster = RelayCluster::start(1);
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    cluster.coordinator.ingest(&sample_doc(2)).await.unwrap();
    assert!(cluster.wait_drained().await);
    assert!(cluster.followers[0].remove(SAMPLE_INDEX, &sample_doc_id(2)).await);

    let auditor = cluster.auditor(false);
    let reports = auditor.run_once(false).await.unwrap();

    let report = &reports[0];
    assert!(report.drift);
    assert_eq!(report.leader_count, 2);
    assert_eq!(report.follower_count, 1);
    assert_eq!(report.missing_doc_ids, vec![sample_doc_id(2)]);
    assert_ne!(report.leader_checksum, report.follower_checksum);
    assert_eq!(report.repaired, 0);

    assert_eq!(auditor.recent_reports(10).await.len(), 1);
}

#[tokio::test]
async fn test_repair_reenqueues_missing_documents() {
    let cluster = RelayCluster::start(1);
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert!(cluster.wait_drained().await);
    assert!(cluster.followers[0].remove(SAMPLE_INDEX, &sample_doc_id(1)).await);

    let auditor = cluster.auditor(true);
    let reports = auditor.run_once(true).await.unwrap();
    assert!(reports[0].drift);
    assert_eq!(reports[0].repaired, 1);

    assert!(
        wait_until(
            || async {
                cluster.followers[0]
                    .document(SAMPLE_INDEX, &sample_doc_id(1))
                    .await
                    .is_some()
            },
            Duration::from_secs(5)
        )
        .await
    );

    let reports = auditor.run_once(false).await.unwrap();
    assert!(reports[0].clean());
}

#[tokio::test]
async fn test_equal_counts_with_divergent_ids_is_drift() {
    let cluster = RelayCluster::start(1);
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    cluster.coordinator.ingest(&sample_doc(2)).await.unwrap();
    assert!(cluster.wait_drained().await);
    assert!(cluster.followers[0].remove(SAMPLE_INDEX, &sample_doc_id(1)).await);
    cluster.followers[0]
        .seed(SAMPLE_INDEX, "ghost/latency/", sample_doc(9))
        .await;

    let auditor = cluster.auditor(false);
    let reports = auditor.run_once(false).await.unwrap();

    let report = &reports[0];
    assert!(report.drift);
    assert_eq!(report.leader_count, 2);
    assert_eq!(report.follower_count, 2);
    assert_eq!(report.missing_doc_ids, vec![sample_doc_id(1)]);
    assert_eq!(report.extra_count, 1);
}

#[tokio::test]
async fn test_recent_documents_outside_window_are_ignored() {
    let cluster = RelayCluster::start(1);
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert!(cluster.wait_drained().await);

    // Landed on the leader but not yet replicated; its timestamp is ahead
    // of the audit window so the pass must not flag it.
    cluster
        .leader
        .seed(
            "benchmark-results-2099-01",
            "exec-9999/throughput/index-append",
            sample_doc_at("20990101T000000Z", 9999),
        )
        .await;

    let auditor = cluster.auditor(false);
    let reports = auditor.run_once(false).await.unwrap();

    let report = &reports[0];
    assert!(report.clean());
    assert_eq!(report.leader_count, 1);
}

#[tokio::test]
async fn test_run_loop_reports_until_shutdown() {
    let cluster = RelayCluster::start(1);
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert!(cluster.wait_drained().await);

    let auditor = cluster.auditor(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(auditor.clone().run_loop(shutdown_rx));

    assert!(
        wait_until(
            || async { !auditor.recent_reports(1).await.is_empty() },
            Duration::from_secs(5)
        )
        .await
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
