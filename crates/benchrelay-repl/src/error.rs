//! Replication subsystem errors.

use thiserror::Error;

use benchrelay_model::SchemaError;
use benchrelay_store::StoreError;

/// Errors raised by the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// The document failed schema validation. Client-caused; never retried.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A store interaction failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A queue log or cursor file is unreadable beyond repair.
    #[error("queue corrupted: {msg}")]
    QueueCorrupted {
        /// What could not be read.
        msg: String,
    },

    /// No follower registered under this id.
    #[error("unknown follower: {follower_id}")]
    UnknownFollower {
        /// The id as requested.
        follower_id: String,
    },

    /// A queue record could not be encoded or decoded.
    #[error("task serialization failed")]
    Serialization(#[from] bincode::Error),

    /// Filesystem failure underneath a queue or dead-letter store.
    #[error("queue I/O failed")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    /// True when the underlying store failure is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplError::Store(e) if e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_errors_are_not_retryable() {
        let err = ReplError::from(SchemaError::new("value", "required field is missing"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_store_retryability_passes_through() {
        let transient = ReplError::from(StoreError::Timeout {
            msg: "deadline".to_string(),
        });
        assert!(transient.is_retryable());

        let rejected = ReplError::from(StoreError::Rejected {
            status: 400,
            reason: "bad mapping".to_string(),
        });
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn test_schema_error_message_passthrough() {
        let err = ReplError::from(SchemaError::new("name", "required field is missing"));
        assert_eq!(
            err.to_string(),
            "schema error on field [name]: required field is missing"
        );
    }
}
