#![warn(missing_docs)]

//! Benchrelay replication: validated ingest through the coordinator, durable
//! per-follower queues drained by retrying workers, dead-letter capture, and
//! the reconciliation auditor that detects and repairs drift.

pub mod auditor;
pub mod backoff;
pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod queue;
pub mod task;
pub mod worker;

pub use auditor::{AuditorConfig, DriftReport, ReconciliationAuditor};
pub use backoff::{BackoffPolicy, RetryBackoff};
pub use coordinator::{
    BatchReceipt, CoordinatorConfig, FollowerSpec, IngestReceipt, ReplicationCoordinator,
};
pub use dead_letter::{DeadLetterRecord, DeadLetterStore};
pub use error::ReplError;
pub use queue::{follower_dir_name, TaskQueue};
pub use task::{epoch_ms, ReplicationTask, TaskState};
pub use worker::{CurrentTask, FollowerStatus, FollowerWorker, WorkerConfig, WorkerState};
