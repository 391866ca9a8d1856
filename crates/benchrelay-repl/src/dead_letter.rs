//! Dead-letter capture for tasks that exhausted delivery retries.
//!
//! Records are JSON lines in the follower's queue directory, one object per
//! line, append-only. Operators list them through the API or CLI and replay
//! them once the underlying cause (usually a mapping problem on the
//! follower) is fixed.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::ReplError;
use crate::task::ReplicationTask;

const DEAD_LETTER_FILENAME: &str = "dead_letter.jsonl";

/// A task that exhausted retries, kept for inspection and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Record id, distinct from the document id.
    pub id: Uuid,
    /// Follower the delivery was for.
    pub follower_id: String,
    /// Sequence number the task carried in its queue.
    pub seq: u64,
    /// Index the document belongs to.
    pub index: String,
    /// Document id.
    pub doc_id: String,
    /// The document body as it would have been written.
    pub document: serde_json::Value,
    /// Attempts consumed before giving up.
    pub attempts: u32,
    /// The final delivery error.
    pub error: String,
    /// When the task was dead-lettered, milliseconds since epoch.
    pub dead_lettered_at_ms: u64,
}

/// Durable JSON-lines store of dead-lettered tasks for one follower.
pub struct DeadLetterStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl DeadLetterStore {
    /// Open (or create) the dead-letter file in `dir`.
    pub fn open(dir: &Path) -> Result<Self, ReplError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DEAD_LETTER_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, File>, ReplError> {
        self.file.lock().map_err(|e| ReplError::QueueCorrupted {
            msg: format!("dead-letter lock poisoned: {e}"),
        })
    }

    /// Persist one dead-lettered task. Durable on return.
    pub fn record(
        &self,
        task: &ReplicationTask,
        error: &str,
        now_ms: u64,
    ) -> Result<DeadLetterRecord, ReplError> {
        // A payload that stopped parsing is still worth keeping; embed it
        // as a raw string rather than dropping the record.
        let document = serde_json::from_slice(&task.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&task.payload).into_owned())
        });
        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            follower_id: task.follower_id.clone(),
            seq: task.seq,
            index: task.index.clone(),
            doc_id: task.doc_id.clone(),
            document,
            attempts: task.attempts,
            error: error.to_string(),
            dead_lettered_at_ms: now_ms,
        };
        let mut line = serde_json::to_string(&record).map_err(|e| ReplError::QueueCorrupted {
            msg: format!("dead-letter record does not serialize: {e}"),
        })?;
        line.push('\n');

        let mut file = self.lock()?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        Ok(record)
    }

    /// All records currently on disk.
    pub fn list(&self) -> Result<Vec<DeadLetterRecord>, ReplError> {
        let _guard = self.lock()?;
        self.read_all()
    }

    /// Remove and return every record, for replay.
    pub fn drain(&self) -> Result<Vec<DeadLetterRecord>, ReplError> {
        let mut file = self.lock()?;
        let records = self.read_all()?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_all()?;
        Ok(records)
    }

    /// Number of records on disk.
    pub fn len(&self) -> Result<usize, ReplError> {
        Ok(self.list()?.len())
    }

    /// True when no records are on disk.
    pub fn is_empty(&self) -> Result<bool, ReplError> {
        Ok(self.len()? == 0)
    }

    fn read_all(&self) -> Result<Vec<DeadLetterRecord>, ReplError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        error = %e,
                        "skipping unreadable dead-letter record"
                    );
                }
            }
        }
        Ok(records)
    }
}
