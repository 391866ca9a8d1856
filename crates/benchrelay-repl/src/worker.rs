//! Per-follower replication workers.
//!
//! One worker owns the consumer side of one follower's durable queue. It
//! drains tasks in FIFO order, retries transient failures with jittered
//! backoff, pauses the whole queue while the follower is unreachable, and
//! dead-letters tasks that exhaust the attempt ceiling. Ordering holds
//! because the head task is never skipped: either it acks, or it leaves
//! through the dead-letter store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use benchrelay_store::{DocumentStore, Health};

use crate::backoff::{BackoffPolicy, RetryBackoff};
use crate::dead_letter::DeadLetterStore;
use crate::queue::TaskQueue;
use crate::task::{epoch_ms, ReplicationTask, TaskState};

/// Tunables for one follower worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Attempts per task before it is dead-lettered.
    pub retry_ceiling: u32,
    /// Backoff bounds between attempts.
    pub backoff: BackoffPolicy,
    /// How long the follower may be unreachable before the queue pauses.
    pub unreachable_grace: Duration,
    /// Health poll interval while paused.
    pub health_probe_interval: Duration,
    /// Idle poll interval when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 10,
            backoff: BackoffPolicy::default(),
            unreachable_grace: Duration::from_secs(10),
            health_probe_interval: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// What the worker loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Queue empty, polling for work.
    Idle,
    /// Delivering or retrying the head task.
    Replicating,
    /// Follower unreachable beyond the grace window; probing health.
    Paused,
    /// Shut down.
    Stopped,
}

/// The task currently at the head of the queue, as seen by operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentTask {
    /// Queue sequence number.
    pub seq: u64,
    /// Document being delivered.
    pub doc_id: String,
    /// Delivery state.
    pub state: TaskState,
    /// Attempts consumed so far.
    pub attempts: u32,
}

/// Point-in-time view of one follower's replication progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerStatus {
    /// Follower this status describes.
    pub follower_id: String,
    /// Worker loop state.
    pub state: WorkerState,
    /// Tasks waiting in the durable queue.
    pub backlog_depth: usize,
    /// Age of the oldest pending task, if any.
    pub oldest_pending_ms: Option<u64>,
    /// Head task detail, if one is being worked.
    pub current: Option<CurrentTask>,
    /// Tasks delivered and acknowledged since startup.
    pub acked_total: u64,
    /// Transient failures retried since startup.
    pub retried_total: u64,
    /// Tasks dead-lettered since startup.
    pub dead_lettered_total: u64,
    /// Most recent delivery error, if any.
    pub last_error: Option<String>,
}

impl FollowerStatus {
    fn new(follower_id: &str, backlog_depth: usize) -> Self {
        Self {
            follower_id: follower_id.to_string(),
            state: WorkerState::Idle,
            backlog_depth,
            oldest_pending_ms: None,
            current: None,
            acked_total: 0,
            retried_total: 0,
            dead_lettered_total: 0,
            last_error: None,
        }
    }
}

/// Handle to one spawned follower worker.
pub struct FollowerWorker {
    follower_id: String,
    store: Arc<dyn DocumentStore>,
    queue: Arc<TaskQueue>,
    dead_letters: Arc<DeadLetterStore>,
    status: Arc<RwLock<FollowerStatus>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FollowerWorker {
    /// Spawn the worker loop for one follower.
    pub fn spawn(
        follower_id: String,
        store: Arc<dyn DocumentStore>,
        queue: Arc<TaskQueue>,
        dead_letters: Arc<DeadLetterStore>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let status = Arc::new(RwLock::new(FollowerStatus::new(&follower_id, queue.len())));
        let worker_loop = WorkerLoop {
            follower_id: follower_id.clone(),
            store: store.clone(),
            queue: queue.clone(),
            dead_letters: dead_letters.clone(),
            config,
            status: status.clone(),
            shutdown,
        };
        let handle = tokio::spawn(worker_loop.run());
        Self {
            follower_id,
            store,
            queue,
            dead_letters,
            status,
            handle: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    /// Follower this worker delivers to.
    pub fn follower_id(&self) -> &str {
        &self.follower_id
    }

    /// The follower's store client.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// The follower's durable queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// The follower's dead-letter store.
    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    /// Current status, with backlog numbers sampled fresh.
    pub async fn status(&self) -> FollowerStatus {
        let mut status = self.status.read().await.clone();
        status.backlog_depth = self.queue.len();
        status.oldest_pending_ms = self.queue.oldest_pending_age_ms(epoch_ms());
        status
    }

    /// Wait for the worker loop to exit. Idempotent.
    pub async fn join(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(follower = %self.follower_id, error = %e, "worker task failed");
            }
        }
    }
}

struct WorkerLoop {
    follower_id: String,
    store: Arc<dyn DocumentStore>,
    queue: Arc<TaskQueue>,
    dead_letters: Arc<DeadLetterStore>,
    config: WorkerConfig,
    status: Arc<RwLock<FollowerStatus>>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerLoop {
    async fn run(mut self) {
        info!(follower = %self.follower_id, "replication worker started");
        let mut backoff = RetryBackoff::new(self.config.backoff.clone());
        let mut attempts: u32 = 0;
        let mut unreachable_since: Option<Instant> = None;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let Some(task) = self.queue.peek() else {
                self.with_status(|s| {
                    s.state = WorkerState::Idle;
                    s.current = None;
                })
                .await;
                if self.sleep(self.config.poll_interval).await {
                    break;
                }
                continue;
            };

            self.with_status(|s| {
                s.state = WorkerState::Replicating;
                s.current = Some(CurrentTask {
                    seq: task.seq,
                    doc_id: task.doc_id.clone(),
                    state: TaskState::InFlight,
                    attempts,
                });
            })
            .await;

            let doc = match task.document_json() {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(
                        follower = %self.follower_id,
                        seq = task.seq,
                        error = %e,
                        "task payload unreadable, dead-lettering"
                    );
                    if self.dead_letter(&task, &e.to_string(), attempts).await {
                        attempts = 0;
                        backoff.reset();
                    } else if self.sleep(self.config.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            match self.store.put(&task.index, &task.doc_id, &doc).await {
                Ok(()) => {
                    unreachable_since = None;
                    match self.queue.ack(task.seq) {
                        Ok(()) => {
                            attempts = 0;
                            backoff.reset();
                            self.with_status(|s| {
                                s.acked_total += 1;
                                s.current = None;
                                s.last_error = None;
                            })
                            .await;
                            debug!(
                                follower = %self.follower_id,
                                seq = task.seq,
                                doc_id = %task.doc_id,
                                "replicated"
                            );
                        }
                        Err(e) => {
                            // Delivered but not acknowledged; the re-put after
                            // this pause is idempotent.
                            error!(
                                follower = %self.follower_id,
                                seq = task.seq,
                                error = %e,
                                "queue ack failed"
                            );
                            if self.sleep(self.config.poll_interval).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) if e.is_retryable() => {
                    if self.store.health().await == Health::Unreachable {
                        // Attempts do not advance while the follower is down;
                        // an outage must not walk tasks toward the ceiling.
                        let since = *unreachable_since.get_or_insert_with(Instant::now);
                        self.with_status(|s| {
                            s.last_error = Some(e.to_string());
                            if let Some(current) = &mut s.current {
                                current.state = TaskState::Retrying;
                            }
                        })
                        .await;
                        if since.elapsed() >= self.config.unreachable_grace {
                            warn!(
                                follower = %self.follower_id,
                                "follower unreachable beyond grace window, pausing queue"
                            );
                            if self.pause_until_reachable().await {
                                break;
                            }
                            unreachable_since = None;
                            backoff.reset();
                        } else if self.sleep(backoff.next_delay()).await {
                            break;
                        }
                    } else {
                        unreachable_since = None;
                        attempts += 1;
                        self.with_status(|s| {
                            s.retried_total += 1;
                            s.last_error = Some(e.to_string());
                            if let Some(current) = &mut s.current {
                                current.state = TaskState::Retrying;
                                current.attempts = attempts;
                            }
                        })
                        .await;
                        if attempts >= self.config.retry_ceiling {
                            warn!(
                                follower = %self.follower_id,
                                doc_id = %task.doc_id,
                                attempts,
                                error = %e,
                                "retry ceiling reached, dead-lettering"
                            );
                            if self.dead_letter(&task, &e.to_string(), attempts).await {
                                attempts = 0;
                                backoff.reset();
                            } else if self.sleep(self.config.poll_interval).await {
                                break;
                            }
                        } else {
                            debug!(
                                follower = %self.follower_id,
                                doc_id = %task.doc_id,
                                attempt = attempts,
                                error = %e,
                                "transient delivery failure, backing off"
                            );
                            if self.sleep(backoff.next_delay()).await {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    // The follower decided; retrying the same body cannot help.
                    warn!(
                        follower = %self.follower_id,
                        doc_id = %task.doc_id,
                        error = %e,
                        "follower rejected document, dead-lettering"
                    );
                    if self.dead_letter(&task, &e.to_string(), attempts + 1).await {
                        attempts = 0;
                        backoff.reset();
                    } else if self.sleep(self.config.poll_interval).await {
                        break;
                    }
                }
            }
        }

        self.with_status(|s| {
            s.state = WorkerState::Stopped;
            s.current = None;
        })
        .await;
        info!(follower = %self.follower_id, "replication worker stopped");
    }

    /// Probe health until the follower answers again. Returns true on shutdown.
    async fn pause_until_reachable(&mut self) -> bool {
        self.with_status(|s| s.state = WorkerState::Paused).await;
        loop {
            if self.sleep(self.config.health_probe_interval).await {
                return true;
            }
            if self.store.health().await != Health::Unreachable {
                info!(follower = %self.follower_id, "follower reachable again, resuming queue");
                self.with_status(|s| s.state = WorkerState::Replicating).await;
                return false;
            }
        }
    }

    /// Sleep, waking early on shutdown. Returns true on shutdown.
    async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }

    /// Move the head task to the dead-letter store and ack it.
    ///
    /// Returns false when the record could not be persisted; the task then
    /// stays at the head and is retried later rather than dropped.
    async fn dead_letter(&self, task: &ReplicationTask, error: &str, attempts: u32) -> bool {
        let mut annotated = task.clone();
        annotated.attempts = attempts;
        annotated.last_error = Some(error.to_string());
        if let Err(e) = self.dead_letters.record(&annotated, error, epoch_ms()) {
            error!(
                follower = %self.follower_id,
                seq = task.seq,
                error = %e,
                "failed to persist dead-letter record, keeping task queued"
            );
            return false;
        }
        if let Err(e) = self.queue.ack(task.seq) {
            error!(
                follower = %self.follower_id,
                seq = task.seq,
                error = %e,
                "queue ack failed after dead-lettering"
            );
            return false;
        }
        self.with_status(|s| {
            s.dead_lettered_total += 1;
            s.last_error = Some(error.to_string());
            if let Some(current) = &mut s.current {
                current.state = TaskState::DeadLettered;
            }
        })
        .await;
        true
    }

    async fn with_status<F: FnOnce(&mut FollowerStatus)>(&self, f: F) {
        let mut status = self.status.write().await;
        f(&mut status);
        status.backlog_depth = self.queue.len();
        status.oldest_pending_ms = self.queue.oldest_pending_age_ms(epoch_ms());
    }
}
