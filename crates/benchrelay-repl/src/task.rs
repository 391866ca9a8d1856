//! Replication tasks: one pending propagation of one document to one follower.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use benchrelay_model::ResultDocument;

use crate::error::ReplError;

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Delivery lifecycle of a task.
///
/// `Pending -> InFlight -> Acked`, with `Retrying` looping back to
/// `InFlight` and `DeadLettered` terminal after the retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the queue.
    Pending,
    /// A delivery attempt is running.
    InFlight,
    /// The follower acknowledged the write.
    Acked,
    /// A transient failure occurred; another attempt is scheduled.
    Retrying,
    /// Retries are exhausted; the task moved to the dead-letter store.
    DeadLettered,
}

/// One pending propagation of a result document to one follower.
///
/// The payload carries the document's canonical JSON bytes, so replay after
/// a restart re-puts exactly what the leader accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// Per-follower sequence number, assigned when the queue accepts the task.
    pub seq: u64,
    /// Follower this task targets.
    pub follower_id: String,
    /// Index the document belongs to.
    pub index: String,
    /// Document id (`execution/name/task`), the idempotency key.
    pub doc_id: String,
    /// Canonical JSON bytes of the document.
    pub payload: Vec<u8>,
    /// When the task was enqueued, milliseconds since epoch.
    pub enqueued_at_ms: u64,
    /// Delivery attempts so far. Not persisted; resets on restart.
    pub attempts: u32,
    /// Message of the most recent delivery failure.
    pub last_error: Option<String>,
}

impl ReplicationTask {
    /// Build a task for one follower from a validated document.
    ///
    /// The sequence number stays zero until the queue assigns one.
    pub fn new(follower_id: String, doc: &ResultDocument, enqueued_at_ms: u64) -> Self {
        ReplicationTask {
            seq: 0,
            follower_id,
            index: doc.index_name(),
            doc_id: doc.doc_id(),
            payload: doc.to_json().to_string().into_bytes(),
            enqueued_at_ms,
            attempts: 0,
            last_error: None,
        }
    }

    /// Decode the payload back to its JSON document.
    pub fn document_json(&self) -> Result<serde_json::Value, ReplError> {
        serde_json::from_slice(&self.payload).map_err(|e| ReplError::QueueCorrupted {
            msg: format!("task {} payload is not JSON: {e}", self.seq),
        })
    }

    /// Age of this task relative to `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.enqueued_at_ms)
    }
}
