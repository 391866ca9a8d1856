//! Test harness: in-memory relay cluster with millisecond-scale timings.

use benchrelay_repl::{
    AuditorConfig, BackoffPolicy, CoordinatorConfig, FollowerSpec, ReconciliationAuditor,
    ReplicationCoordinator, WorkerConfig,
};
use benchrelay_store::{DocumentStore, MemoryDocumentStore};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Index the default sample documents land in.
pub const SAMPLE_INDEX: &str = "benchmark-results-2025-01";

/// A coordinator over in-memory stores, queues on a throwaway directory.
pub struct RelayCluster {
    pub coordinator: Arc<ReplicationCoordinator>,
    pub leader: MemoryDocumentStore,
    pub followers: Vec<MemoryDocumentStore>,
    config: CoordinatorConfig,
    queue_dir: TempDir,
}

impl RelayCluster {
    pub fn start(follower_count: usize) -> Self {
        Self::start_with_config(follower_count, fast_coordinator_config())
    }

    pub fn start_with_config(follower_count: usize, config: CoordinatorConfig) -> Self {
        let queue_dir = tempfile::tempdir().expect("failed to create temp dir");
        let leader = MemoryDocumentStore::new();
        let followers: Vec<MemoryDocumentStore> = (0..follower_count)
            .map(|_| MemoryDocumentStore::new())
            .collect();
        Self::assemble(leader, followers, config, queue_dir)
    }

    fn assemble(
        leader: MemoryDocumentStore,
        followers: Vec<MemoryDocumentStore>,
        config: CoordinatorConfig,
        queue_dir: TempDir,
    ) -> Self {
        let specs = followers
            .iter()
            .enumerate()
            .map(|(i, store)| FollowerSpec {
                id: Self::follower_id(i),
                store: Arc::new(store.clone()) as Arc<dyn DocumentStore>,
            })
            .collect();

        let coordinator = Arc::new(
            ReplicationCoordinator::start(
                Arc::new(leader.clone()) as Arc<dyn DocumentStore>,
                specs,
                config.clone(),
                queue_dir.path(),
            )
            .expect("coordinator start"),
        );

        Self {
            coordinator,
            leader,
            followers,
            config,
            queue_dir,
        }
    }

    /// Follower id assigned to the store at `index`.
    pub fn follower_id(index: usize) -> String {
        format!("dc{}", index + 2)
    }

    /// Stop the coordinator and bring it back up on the same queue
    /// directory and the same stores, as a daemon restart would.
    pub async fn restart(self) -> Self {
        self.coordinator.shutdown().await;
        let Self {
            leader,
            followers,
            config,
            queue_dir,
            ..
        } = self;
        Self::assemble(leader, followers, config, queue_dir)
    }

    /// An auditor over this cluster with a tight schedule and no
    /// in-flight tolerance.
    pub fn auditor(&self, repair: bool) -> Arc<ReconciliationAuditor> {
        Arc::new(ReconciliationAuditor::new(
            self.coordinator.clone(),
            AuditorConfig {
                interval: Duration::from_millis(20),
                tolerance: Duration::ZERO,
                repair,
                ..AuditorConfig::default()
            },
        ))
    }

    pub fn backlog(&self, follower: usize) -> usize {
        self.coordinator.followers()[follower].queue().len()
    }

    async fn drained(&self) -> bool {
        self.coordinator
            .followers()
            .iter()
            .all(|worker| worker.queue().is_empty())
    }

    /// Wait until every follower queue is empty.
    pub async fn wait_drained(&self) -> bool {
        wait_until(|| self.drained(), Duration::from_secs(5)).await
    }
}

pub fn fast_coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        leader_write_timeout: Duration::from_millis(500),
        leader_retry_attempts: 3,
        leader_backoff: fast_backoff(),
        worker: fast_worker_config(3),
        default_environment: None,
    }
}

pub fn fast_worker_config(retry_ceiling: u32) -> WorkerConfig {
    WorkerConfig {
        retry_ceiling,
        backoff: fast_backoff(),
        unreachable_grace: Duration::from_millis(50),
        health_probe_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(5),
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(2),
        max: Duration::from_millis(10),
    }
}

/// A valid result document for execution `exec-{n:04}`, dated well in
/// the past so reconciliation windows include it.
pub fn sample_doc(n: u32) -> serde_json::Value {
    sample_doc_at("20250114T090000Z", n)
}

pub fn sample_doc_at(timestamp: &str, n: u32) -> serde_json::Value {
    json!({
        "test-execution-id": format!("exec-{:04}", n),
        "test-execution-timestamp": timestamp,
        "environment": "nightly",
        "workload": "geonames",
        "test_procedure": "append-no-conflicts",
        "task": "index-append",
        "name": "throughput",
        "value": { "median": 1000.0 + n as f64, "unit": "docs/s" }
    })
}

/// Document id `sample_doc(n)` lands under.
pub fn sample_doc_id(n: u32) -> String {
    format!("exec-{:04}/throughput/index-append", n)
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(mut cond: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
