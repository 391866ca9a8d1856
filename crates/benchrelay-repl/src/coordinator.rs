//! The replication coordinator: validated ingest, a synchronous leader
//! write, and asynchronous fan-out to per-follower durable queues.
//!
//! The caller's success is decided by the leader alone. Follower enqueue
//! failures are logged and left to the reconciliation auditor; they never
//! fail an ingest whose leader write already succeeded.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use benchrelay_model::{ResultDocument, SchemaValidator};
use benchrelay_store::{DocumentStore, StoreError};

use crate::backoff::{BackoffPolicy, RetryBackoff};
use crate::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::error::ReplError;
use crate::queue::{follower_dir_name, TaskQueue};
use crate::task::{epoch_ms, ReplicationTask};
use crate::worker::{FollowerStatus, FollowerWorker, WorkerConfig};

/// One replication target: an operator-facing id plus its store client.
pub struct FollowerSpec {
    /// Follower id, typically its URL.
    pub id: String,
    /// Store client for the follower cluster.
    pub store: Arc<dyn DocumentStore>,
}

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound on one leader write attempt.
    pub leader_write_timeout: Duration,
    /// Attempts for a leader write before the failure surfaces to the caller.
    pub leader_retry_attempts: u32,
    /// Backoff bounds between leader write attempts.
    pub leader_backoff: BackoffPolicy,
    /// Tunables handed to every follower worker.
    pub worker: WorkerConfig,
    /// Applied to documents that carry no environment of their own.
    pub default_environment: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            leader_write_timeout: Duration::from_secs(30),
            leader_retry_attempts: 11,
            leader_backoff: BackoffPolicy::default(),
            worker: WorkerConfig::default(),
            default_environment: None,
        }
    }
}

/// Receipt returned once the leader acknowledged one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Document id the write landed under.
    pub doc_id: String,
    /// Index the document landed in.
    pub index: String,
    /// Follower queues the document was enqueued to.
    pub followers_enqueued: usize,
}

/// Receipt for a batch ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceipt {
    /// Documents validated and written to the leader.
    pub accepted: usize,
    /// Enqueue operations across documents and followers.
    pub followers_enqueued: usize,
}

/// Coordinates validated ingest and replication fan-out.
pub struct ReplicationCoordinator {
    validator: SchemaValidator,
    leader: Arc<dyn DocumentStore>,
    followers: Vec<FollowerWorker>,
    config: CoordinatorConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl ReplicationCoordinator {
    /// Open the per-follower queues under `queue_root` and spawn one worker
    /// per follower. Backlogs persisted by a previous process resume here.
    pub fn start(
        leader: Arc<dyn DocumentStore>,
        followers: Vec<FollowerSpec>,
        config: CoordinatorConfig,
        queue_root: &Path,
    ) -> Result<Self, ReplError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::with_capacity(followers.len());
        for spec in followers {
            let dir = queue_root.join(follower_dir_name(&spec.id));
            let queue = Arc::new(TaskQueue::open(&dir)?);
            let dead_letters = Arc::new(DeadLetterStore::open(&dir)?);
            let backlog = queue.len();
            if backlog > 0 {
                info!(follower = %spec.id, backlog, "resuming persisted replication backlog");
            }
            workers.push(FollowerWorker::spawn(
                spec.id,
                spec.store,
                queue,
                dead_letters,
                config.worker.clone(),
                shutdown_rx.clone(),
            ));
        }
        info!(followers = workers.len(), "replication coordinator started");
        Ok(Self {
            validator: SchemaValidator::new(),
            leader,
            followers: workers,
            config,
            shutdown_tx,
        })
    }

    /// The leader's store client.
    pub fn leader_store(&self) -> &Arc<dyn DocumentStore> {
        &self.leader
    }

    /// Registered follower workers.
    pub fn followers(&self) -> &[FollowerWorker] {
        &self.followers
    }

    /// Registered follower ids.
    pub fn follower_ids(&self) -> Vec<String> {
        self.followers
            .iter()
            .map(|w| w.follower_id().to_string())
            .collect()
    }

    /// Validate one raw document, write it to the leader, and fan out.
    ///
    /// Returns only after the leader acknowledged the write. Fan-out is
    /// enqueue-only; follower durability happens off this path.
    pub async fn ingest(&self, raw: &Value) -> Result<IngestReceipt, ReplError> {
        let mut doc = self.validator.validate(raw)?;
        self.apply_defaults(&mut doc);
        let index = doc.index_name();
        let doc_id = doc.doc_id();
        self.leader_put(&index, &doc_id, &doc.to_json()).await?;
        let followers_enqueued = self.fan_out(&doc);
        Ok(IngestReceipt {
            doc_id,
            index,
            followers_enqueued,
        })
    }

    /// Validate every document, bulk-write to the leader, then fan out.
    ///
    /// Validation is all-or-nothing: one bad document fails the whole batch
    /// before a single write happens.
    pub async fn ingest_batch(&self, raws: &[Value]) -> Result<BatchReceipt, ReplError> {
        let mut docs = Vec::with_capacity(raws.len());
        for raw in raws {
            let mut doc = self.validator.validate(raw)?;
            self.apply_defaults(&mut doc);
            docs.push(doc);
        }
        if docs.is_empty() {
            return Ok(BatchReceipt {
                accepted: 0,
                followers_enqueued: 0,
            });
        }

        // one bulk request per monthly index
        let mut by_index: BTreeMap<String, Vec<&ResultDocument>> = BTreeMap::new();
        for doc in &docs {
            by_index.entry(doc.index_name()).or_default().push(doc);
        }

        let mut followers_enqueued = 0;
        for (index, group) in by_index {
            let payload: Vec<(String, Value)> = group
                .iter()
                .map(|doc| (doc.doc_id(), doc.to_json()))
                .collect();
            self.leader_bulk_put(&index, &payload).await?;
            for doc in group {
                followers_enqueued += self.fan_out(doc);
            }
        }
        Ok(BatchReceipt {
            accepted: docs.len(),
            followers_enqueued,
        })
    }

    /// Current replication status for every follower.
    pub async fn lag_report(&self) -> Vec<FollowerStatus> {
        let mut report = Vec::with_capacity(self.followers.len());
        for worker in &self.followers {
            report.push(worker.status().await);
        }
        report
    }

    /// Dead-letter records for one follower.
    pub fn dead_letters(&self, follower_id: &str) -> Result<Vec<DeadLetterRecord>, ReplError> {
        self.worker(follower_id)?.dead_letters().list()
    }

    /// Dead-letter records across all followers.
    pub fn all_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, ReplError> {
        let mut records = Vec::new();
        for worker in &self.followers {
            records.extend(worker.dead_letters().list()?);
        }
        Ok(records)
    }

    /// Move one follower's dead letters back onto its queue.
    pub fn replay_dead_letters(&self, follower_id: &str) -> Result<usize, ReplError> {
        let worker = self.worker(follower_id)?;
        let records = worker.dead_letters().drain()?;
        let total = records.len();
        let now = epoch_ms();
        let mut replayed = 0;
        for record in records {
            let task = record_to_task(&record, follower_id, now);
            match worker.queue().append(task) {
                Ok(seq) => {
                    replayed += 1;
                    debug!(follower = %follower_id, doc_id = %record.doc_id, seq, "dead letter re-enqueued");
                }
                Err(e) => {
                    error!(
                        follower = %follower_id,
                        doc_id = %record.doc_id,
                        error = %e,
                        "failed to re-enqueue dead letter, keeping record"
                    );
                    let restore = record_to_task(&record, follower_id, record.dead_lettered_at_ms);
                    if let Err(e) =
                        worker
                            .dead_letters()
                            .record(&restore, &record.error, record.dead_lettered_at_ms)
                    {
                        error!(
                            follower = %follower_id,
                            doc_id = %record.doc_id,
                            error = %e,
                            "failed to restore dead-letter record"
                        );
                    }
                }
            }
        }
        info!(follower = %follower_id, replayed, total, "dead letters replayed");
        Ok(replayed)
    }

    /// Enqueue one already-validated document for one follower.
    ///
    /// The auditor's repair path lands here with documents re-read from the
    /// leader.
    pub fn enqueue_document(
        &self,
        follower_id: &str,
        doc: &ResultDocument,
    ) -> Result<u64, ReplError> {
        let worker = self.worker(follower_id)?;
        let task = ReplicationTask::new(follower_id.to_string(), doc, epoch_ms());
        worker.queue().append(task)
    }

    /// Signal every worker and wait for them to stop.
    ///
    /// Pending queue entries stay on disk and resume on the next start.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for worker in &self.followers {
            worker.join().await;
        }
        info!("replication coordinator shut down");
    }

    fn worker(&self, follower_id: &str) -> Result<&FollowerWorker, ReplError> {
        self.followers
            .iter()
            .find(|w| w.follower_id() == follower_id)
            .ok_or_else(|| ReplError::UnknownFollower {
                follower_id: follower_id.to_string(),
            })
    }

    fn apply_defaults(&self, doc: &mut ResultDocument) {
        if doc.environment.is_none() {
            doc.environment = self.config.default_environment.clone();
        }
    }

    /// Enqueue one document for every follower. Failures are logged, not
    /// surfaced: the leader write already succeeded.
    fn fan_out(&self, doc: &ResultDocument) -> usize {
        let now = epoch_ms();
        let mut enqueued = 0;
        for worker in &self.followers {
            let task = ReplicationTask::new(worker.follower_id().to_string(), doc, now);
            match worker.queue().append(task) {
                Ok(seq) => {
                    enqueued += 1;
                    debug!(
                        follower = %worker.follower_id(),
                        doc_id = %doc.doc_id(),
                        seq,
                        "enqueued for replication"
                    );
                }
                Err(e) => {
                    error!(
                        follower = %worker.follower_id(),
                        doc_id = %doc.doc_id(),
                        error = %e,
                        "failed to enqueue replication task"
                    );
                }
            }
        }
        enqueued
    }

    async fn leader_put(&self, index: &str, doc_id: &str, body: &Value) -> Result<(), ReplError> {
        let mut backoff = RetryBackoff::new(self.config.leader_backoff.clone());
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.config.leader_write_timeout,
                self.leader.put(index, doc_id, body),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    msg: format!(
                        "leader write exceeded {:?}",
                        self.config.leader_write_timeout
                    ),
                }),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.leader_retry_attempts => {
                    warn!(attempt, doc_id, error = %e, "retryable leader write failure");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => {
                    error!(doc_id, error = %e, "leader write failed");
                    return Err(e.into());
                }
            }
        }
    }

    async fn leader_bulk_put(
        &self,
        index: &str,
        docs: &[(String, Value)],
    ) -> Result<(), ReplError> {
        let mut backoff = RetryBackoff::new(self.config.leader_backoff.clone());
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.config.leader_write_timeout,
                self.leader.bulk_put(index, docs),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    msg: format!(
                        "leader bulk write exceeded {:?}",
                        self.config.leader_write_timeout
                    ),
                }),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.leader_retry_attempts => {
                    warn!(attempt, index, error = %e, "retryable leader bulk failure");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => {
                    error!(index, count = docs.len(), error = %e, "leader bulk write failed");
                    return Err(e.into());
                }
            }
        }
    }
}

fn record_to_task(record: &DeadLetterRecord, follower_id: &str, now_ms: u64) -> ReplicationTask {
    ReplicationTask {
        seq: 0,
        follower_id: follower_id.to_string(),
        index: record.index.clone(),
        doc_id: record.doc_id.clone(),
        payload: record.document.to_string().into_bytes(),
        enqueued_at_ms: now_ms,
        attempts: 0,
        last_error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;
    use benchrelay_store::MemoryDocumentStore;
    use serde_json::json;
    use std::future::Future;
    use tokio::time::Instant;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            leader_write_timeout: Duration::from_secs(2),
            leader_retry_attempts: 2,
            leader_backoff: BackoffPolicy {
                base: Duration::from_millis(2),
                max: Duration::from_millis(10),
            },
            worker: WorkerConfig {
                retry_ceiling: 3,
                backoff: BackoffPolicy {
                    base: Duration::from_millis(2),
                    max: Duration::from_millis(10),
                },
                unreachable_grace: Duration::from_millis(50),
                health_probe_interval: Duration::from_millis(10),
                poll_interval: Duration::from_millis(5),
            },
            default_environment: None,
        }
    }

    struct Fixture {
        leader: Arc<MemoryDocumentStore>,
        follower: Arc<MemoryDocumentStore>,
        coordinator: ReplicationCoordinator,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: CoordinatorConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let leader = Arc::new(MemoryDocumentStore::new());
        let follower = Arc::new(MemoryDocumentStore::new());
        let coordinator = ReplicationCoordinator::start(
            leader.clone(),
            vec![FollowerSpec {
                id: "follower-a".to_string(),
                store: follower.clone(),
            }],
            config,
            dir.path(),
        )
        .unwrap();
        Fixture {
            leader,
            follower,
            coordinator,
            _dir: dir,
        }
    }

    fn raw_doc(n: u64) -> Value {
        json!({
            "test-execution-id": format!("exec-{n}"),
            "test-execution-timestamp": "20260821T101500Z",
            "name": "throughput",
            "task": "index-append",
            "value": {"single": n as f64}
        })
    }

    async fn wait_for<F, Fut>(mut cond: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_ingest_writes_leader_and_fans_out() {
        let fx = fixture(fast_config());
        let receipt = fx.coordinator.ingest(&raw_doc(0)).await.unwrap();
        assert_eq!(receipt.doc_id, "exec-0/throughput/index-append");
        assert_eq!(receipt.index, "benchmark-results-2026-08");
        assert_eq!(receipt.followers_enqueued, 1);

        // leader has the document before ingest returns
        assert!(fx
            .leader
            .document(&receipt.index, &receipt.doc_id)
            .await
            .is_some());

        // the follower catches up asynchronously
        assert!(
            wait_for(
                || async {
                    fx.follower
                        .document("benchmark-results-2026-08", "exec-0/throughput/index-append")
                        .await
                        .is_some()
                },
                Duration::from_secs(5)
            )
            .await
        );
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_schema_error_reaches_no_store() {
        let fx = fixture(fast_config());
        let raw = json!({
            "test-execution-id": "exec-0",
            "test-execution-timestamp": "20260821T101500Z",
            "name": "throughput",
            "value": {}
        });
        let err = fx.coordinator.ingest(&raw).await.unwrap_err();
        assert!(matches!(err, ReplError::Schema(_)));
        assert_eq!(fx.leader.doc_count("benchmark-results-*").await, 0);
        assert_eq!(fx.coordinator.followers()[0].queue().len(), 0);
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_leader_failure_fails_ingest_without_fanout() {
        let fx = fixture(fast_config());
        fx.leader.set_unreachable(true).await;
        let err = fx.coordinator.ingest(&raw_doc(0)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fx.coordinator.followers()[0].queue().len(), 0);
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_leader_write_retries_transient_failure() {
        let fx = fixture(fast_config());
        fx.leader
            .fail_next(StoreError::Timeout {
                msg: "scripted".to_string(),
            })
            .await;
        let receipt = fx.coordinator.ingest(&raw_doc(0)).await.unwrap();
        assert_eq!(receipt.followers_enqueued, 1);
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_outage_does_not_fail_ingest() {
        let fx = fixture(fast_config());
        fx.follower.set_unreachable(true).await;
        let receipt = fx.coordinator.ingest(&raw_doc(0)).await.unwrap();
        assert_eq!(receipt.followers_enqueued, 1);
        assert!(fx
            .leader
            .document("benchmark-results-2026-08", "exec-0/throughput/index-append")
            .await
            .is_some());

        // backlog waits for the follower to come back
        assert!(
            wait_for(
                || async {
                    fx.coordinator.followers()[0].status().await.state == WorkerState::Paused
                },
                Duration::from_secs(5)
            )
            .await
        );
        fx.follower.set_unreachable(false).await;
        assert!(
            wait_for(
                || async { fx.coordinator.followers()[0].queue().is_empty() },
                Duration::from_secs(5)
            )
            .await
        );
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_default_environment_applied() {
        let mut config = fast_config();
        config.default_environment = Some("nightly".to_string());
        let fx = fixture(config);
        let receipt = fx.coordinator.ingest(&raw_doc(0)).await.unwrap();
        let stored = fx
            .leader
            .document(&receipt.index, &receipt.doc_id)
            .await
            .unwrap();
        assert_eq!(stored["environment"], "nightly");

        // explicit environment wins
        let mut raw = raw_doc(1);
        raw["environment"] = json!("release");
        let receipt = fx.coordinator.ingest(&raw).await.unwrap();
        let stored = fx
            .leader
            .document(&receipt.index, &receipt.doc_id)
            .await
            .unwrap();
        assert_eq!(stored["environment"], "release");
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_validation_is_all_or_nothing() {
        let fx = fixture(fast_config());
        let mut bad = raw_doc(1);
        bad["value"] = json!({});
        let batch = vec![raw_doc(0), bad, raw_doc(2)];
        let err = fx.coordinator.ingest_batch(&batch).await.unwrap_err();
        assert!(matches!(err, ReplError::Schema(_)));
        assert_eq!(fx.leader.doc_count("benchmark-results-*").await, 0);
        assert_eq!(fx.coordinator.followers()[0].queue().len(), 0);
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_batch_ingest_accepts_all_valid() {
        let fx = fixture(fast_config());
        let batch: Vec<Value> = (0..4).map(raw_doc).collect();
        let receipt = fx.coordinator.ingest_batch(&batch).await.unwrap();
        assert_eq!(receipt.accepted, 4);
        assert_eq!(receipt.followers_enqueued, 4);
        assert_eq!(fx.leader.doc_count("benchmark-results-*").await, 4);
        assert!(
            wait_for(
                || async { fx.follower.doc_count("benchmark-results-*").await == 4 },
                Duration::from_secs(5)
            )
            .await
        );
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop() {
        let fx = fixture(fast_config());
        let receipt = fx.coordinator.ingest_batch(&[]).await.unwrap();
        assert_eq!(receipt.accepted, 0);
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_follower_is_an_error() {
        let fx = fixture(fast_config());
        let err = fx.coordinator.replay_dead_letters("nope").unwrap_err();
        assert!(matches!(err, ReplError::UnknownFollower { .. }));
        assert!(fx.coordinator.dead_letters("nope").is_err());
        fx.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_lag_report_covers_every_follower() {
        let fx = fixture(fast_config());
        let report = fx.coordinator.lag_report().await;
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].follower_id, "follower-a");
        fx.coordinator.shutdown().await;
    }
}
