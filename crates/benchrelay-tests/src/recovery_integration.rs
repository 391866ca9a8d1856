//! Durable backlogs across restarts, retry ceilings and dead-letter replay.

use crate::harness::{
    fast_coordinator_config, fast_worker_config, sample_doc, sample_doc_id, wait_until,
    RelayCluster, SAMPLE_INDEX,
};
use benchrelay_store::StoreError;
use std::time::Duration;

#[tokio::test]
async fn test_backlog_survives_restart() {
    let cluster = RelayCluster::start(1);
    cluster.followers[0].set_unreachable(true).await;
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    cluster.coordinator.ingest(&sample_doc(2)).await.unwrap();
    assert_eq!(cluster.backlog(0), 2);

    let cluster = cluster.restart().await;
    assert_eq!(cluster.backlog(0), 2);

    cluster.followers[0].set_unreachable(false).await;
    assert!(cluster.wait_drained().await);
    assert_eq!(cluster.followers[0].doc_count(SAMPLE_INDEX).await, 2);
    assert_eq!(
        cluster.followers[0].applied_order().await,
        vec![sample_doc_id(1), sample_doc_id(2)]
    );
}

#[tokio::test]
async fn test_acked_documents_not_redelivered_after_restart() {
    let cluster = RelayCluster::start(1);
    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert!(cluster.wait_drained().await);

    let cluster = cluster.restart().await;
    cluster.coordinator.ingest(&sample_doc(2)).await.unwrap();
    assert!(cluster.wait_drained().await);

    assert_eq!(
        cluster.followers[0].applied_order().await,
        vec![sample_doc_id(1), sample_doc_id(2)]
    );
}

#[tokio::test]
async fn test_retry_ceiling_dead_letters_the_task() {
    let mut config = fast_coordinator_config();
    config.worker = fast_worker_config(2);
    let cluster = RelayCluster::start_with_config(1, config);

    for _ in 0..2 {
        cluster.followers[0]
            .fail_next(StoreError::Timeout {
                msg: "scripted".into(),
            })
            .await;
    }

    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert!(cluster.wait_drained().await);

    let records = cluster.coordinator.dead_letters("dc2").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].doc_id, sample_doc_id(1));
    assert_eq!(records[0].attempts, 2);
    assert!(records[0].error.contains("timeout"));
    assert_eq!(cluster.followers[0].doc_count(SAMPLE_INDEX).await, 0);

    let status = cluster.coordinator.followers()[0].status().await;
    assert_eq!(status.dead_lettered_total, 1);
    assert_eq!(status.retried_total, 2);
}

#[tokio::test]
async fn test_rejection_dead_letters_without_retry_and_replays() {
    let cluster = RelayCluster::start(1);
    cluster.followers[0]
        .fail_next(StoreError::Rejected {
            status: 400,
            reason: "strict_dynamic_mapping_exception".into(),
        })
        .await;

    cluster.coordinator.ingest(&sample_doc(1)).await.unwrap();
    assert!(
        wait_until(
            || async {
                cluster.coordinator.followers()[0]
                    .status()
                    .await
                    .dead_lettered_total
                    == 1
            },
            Duration::from_secs(5)
        )
        .await
    );

    let status = cluster.coordinator.followers()[0].status().await;
    assert_eq!(status.retried_total, 0);

    let records = cluster.coordinator.dead_letters("dc2").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].document["test-execution-id"], "exec-0001");

    let replayed = cluster.coordinator.replay_dead_letters("dc2").unwrap();
    assert_eq!(replayed, 1);
    assert!(cluster.wait_drained().await);
    assert_eq!(cluster.followers[0].doc_count(SAMPLE_INDEX).await, 1);
    assert!(cluster.coordinator.dead_letters("dc2").unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_follower_is_an_error() {
    let cluster = RelayCluster::start(1);

    assert!(cluster.coordinator.dead_letters("nowhere").is_err());
    assert!(cluster.coordinator.replay_dead_letters("nowhere").is_err());
}
