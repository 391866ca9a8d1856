//! Durable, ordered, per-follower replication queues.
//!
//! Each queue is an append-only log of length-prefixed, CRC-framed bincode
//! records plus a cursor file holding the last acknowledged sequence number.
//! The cursor is replaced atomically (write-temp, fsync, rename), so a crash
//! between delivery and acknowledgement re-delivers rather than loses.
//! Replay tolerates a torn tail: a partial or corrupt final record is
//! truncated away, never the records before it.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::ReplError;
use crate::task::ReplicationTask;

const QUEUE_LOG_FILENAME: &str = "queue.log";
const CURSOR_FILENAME: &str = "cursor";

/// Acknowledged records tolerated in the log before it is rewritten.
const COMPACT_THRESHOLD: u64 = 1024;

/// Bytes of frame header: u32 record length plus u32 CRC.
const FRAME_HEADER_LEN: usize = 8;

/// Largest record accepted on replay; anything bigger is a torn length field.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn compute_crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Directory name for one follower's queue, derived from its id.
///
/// Follower ids are URLs; anything outside `[A-Za-z0-9.-]` maps to `-` so
/// the id stays recognizable in the filesystem.
pub fn follower_dir_name(follower_id: &str) -> String {
    follower_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

struct QueueInner {
    log: File,
    log_path: PathBuf,
    cursor_path: PathBuf,
    pending: VecDeque<ReplicationTask>,
    next_seq: u64,
    acked_seq: u64,
    acked_since_compact: u64,
}

/// Durable FIFO queue of replication tasks for one follower.
///
/// Single producer (the coordinator), single consumer (the follower's
/// worker). All operations are synchronous file I/O behind one lock.
pub struct TaskQueue {
    dir: PathBuf,
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    /// Open (or create) the queue stored in `dir`, replaying any backlog
    /// persisted by a previous process.
    pub fn open(dir: &Path) -> Result<Self, ReplError> {
        fs::create_dir_all(dir)?;
        let log_path = dir.join(QUEUE_LOG_FILENAME);
        let cursor_path = dir.join(CURSOR_FILENAME);

        let acked_seq = read_cursor(&cursor_path)?;
        let replay = replay_log(&log_path, acked_seq)?;
        if replay.truncated_bytes > 0 {
            warn!(
                path = %log_path.display(),
                lost_bytes = replay.truncated_bytes,
                "torn record at queue log tail, truncating"
            );
            let file = OpenOptions::new().write(true).open(&log_path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        if !replay.pending.is_empty() {
            info!(
                path = %log_path.display(),
                backlog = replay.pending.len(),
                acked_seq,
                "queue replayed persisted backlog"
            );
        }

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        Ok(TaskQueue {
            dir: dir.to_path_buf(),
            inner: Mutex::new(QueueInner {
                log,
                log_path,
                cursor_path,
                pending: replay.pending,
                next_seq: replay.next_seq,
                acked_seq,
                acked_since_compact: 0,
            }),
        })
    }

    /// Directory this queue persists into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueInner>, ReplError> {
        self.inner.lock().map_err(|e| ReplError::QueueCorrupted {
            msg: format!("queue lock poisoned: {e}"),
        })
    }

    /// Append a task, assigning its sequence number. Durable on return.
    pub fn append(&self, mut task: ReplicationTask) -> Result<u64, ReplError> {
        let mut inner = self.lock()?;
        task.seq = inner.next_seq;
        inner.next_seq += 1;

        let encoded = bincode::serialize(&task)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + encoded.len());
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&compute_crc32(&encoded).to_le_bytes());
        frame.extend_from_slice(&encoded);
        inner.log.write_all(&frame)?;
        inner.log.sync_all()?;

        let seq = task.seq;
        inner.pending.push_back(task);
        debug!(seq, "task appended to queue");
        Ok(seq)
    }

    /// Oldest pending task, if any.
    pub fn peek(&self) -> Option<ReplicationTask> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.pending.front().cloned())
    }

    /// Acknowledge the head task, making the cursor advance durable.
    ///
    /// `seq` must match the head; acks never skip or reorder.
    pub fn ack(&self, seq: u64) -> Result<(), ReplError> {
        let mut inner = self.lock()?;
        match inner.pending.front() {
            Some(head) if head.seq == seq => {
                inner.pending.pop_front();
            }
            Some(head) => {
                return Err(ReplError::QueueCorrupted {
                    msg: format!("ack for seq {seq} does not match queue head {}", head.seq),
                })
            }
            None => {
                return Err(ReplError::QueueCorrupted {
                    msg: format!("ack for seq {seq} on an empty queue"),
                })
            }
        }
        write_cursor(&inner.cursor_path, seq)?;
        inner.acked_seq = seq;
        inner.acked_since_compact += 1;
        if inner.acked_since_compact >= COMPACT_THRESHOLD {
            compact_inner(&mut inner)?;
        }
        Ok(())
    }

    /// Rewrite the log keeping only unacknowledged records.
    pub fn compact(&self) -> Result<(), ReplError> {
        let mut inner = self.lock()?;
        compact_inner(&mut inner)
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.pending.len()).unwrap_or(0)
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last acknowledged sequence number.
    pub fn acked_seq(&self) -> u64 {
        self.inner.lock().map(|inner| inner.acked_seq).unwrap_or(0)
    }

    /// Age of the oldest pending task relative to `now_ms`.
    pub fn oldest_pending_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.pending.front().map(|task| task.age_ms(now_ms)))
    }
}

fn compact_inner(inner: &mut QueueInner) -> Result<(), ReplError> {
    let tmp_path = inner.log_path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for task in &inner.pending {
            let encoded = bincode::serialize(task)?;
            let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + encoded.len());
            frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            frame.extend_from_slice(&compute_crc32(&encoded).to_le_bytes());
            frame.extend_from_slice(&encoded);
            tmp.write_all(&frame)?;
        }
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, &inner.log_path)?;
    inner.log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&inner.log_path)?;
    debug!(
        path = %inner.log_path.display(),
        pending = inner.pending.len(),
        "queue log compacted"
    );
    inner.acked_since_compact = 0;
    Ok(())
}

fn read_cursor(path: &Path) -> Result<u64, ReplError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if bytes.is_empty() {
        return Ok(0);
    }
    let arr: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ReplError::QueueCorrupted {
            msg: format!(
                "cursor file {} has {} bytes, expected 8",
                path.display(),
                bytes.len()
            ),
        })?;
    Ok(u64::from_le_bytes(arr))
}

fn write_cursor(path: &Path, seq: u64) -> Result<(), ReplError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&seq.to_le_bytes())?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

struct Replay {
    pending: VecDeque<ReplicationTask>,
    next_seq: u64,
    valid_len: u64,
    truncated_bytes: u64,
}

/// Read every intact record; stop at the first torn or corrupt frame.
///
/// Records at or below `acked_seq` were already delivered and are skipped.
fn replay_log(path: &Path, acked_seq: u64) -> Result<Replay, ReplError> {
    let mut pending = VecDeque::new();
    let mut next_seq = acked_seq + 1;
    let mut valid_len: u64 = 0;

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(Replay {
                pending,
                next_seq,
                valid_len: 0,
                truncated_bytes: 0,
            })
        }
        Err(e) => return Err(e.into()),
    };
    let total_len = file.metadata()?.len();

    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_RECORD_LEN {
            break;
        }

        let mut record = vec![0u8; len];
        match file.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        if compute_crc32(&record) != crc {
            break;
        }
        let task: ReplicationTask = match bincode::deserialize(&record) {
            Ok(task) => task,
            Err(_) => break,
        };

        valid_len += (FRAME_HEADER_LEN + len) as u64;
        if task.seq + 1 > next_seq {
            next_seq = task.seq + 1;
        }
        if task.seq > acked_seq {
            pending.push_back(task);
        }
    }

    Ok(Replay {
        pending,
        next_seq,
        valid_len,
        truncated_bytes: total_len - valid_len,
    })
}
