//! Store interaction failures, split by retryability.

use thiserror::Error;

/// A failed interaction with a document store.
///
/// `is_retryable` is the contract the replication worker leans on: transient
/// transport failures are retried, rejections are surfaced and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached: connection refused, DNS failure, or
    /// an overload status the cluster sheds load with.
    #[error("store unreachable: {msg}")]
    Unreachable {
        /// Transport-level detail.
        msg: String,
    },

    /// The call did not complete in time. The write may or may not have
    /// applied; retries rely on document-id idempotency.
    #[error("store timeout: {msg}")]
    Timeout {
        /// Timeout detail.
        msg: String,
    },

    /// The store reached a decision and said no.
    #[error("store rejected request (HTTP {status}): {reason}")]
    Rejected {
        /// HTTP status the store answered with.
        status: u16,
        /// Response body, truncated.
        reason: String,
    },

    /// The store answered with a body this client cannot interpret.
    #[error("invalid store response: {msg}")]
    InvalidResponse {
        /// Parse failure detail.
        msg: String,
    },
}

impl StoreError {
    /// True for failures where retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unreachable { .. } | StoreError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(StoreError::Unreachable {
            msg: "connection refused".to_string()
        }
        .is_retryable());
        assert!(StoreError::Timeout {
            msg: "deadline exceeded".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_rejections_are_not_retryable() {
        assert!(!StoreError::Rejected {
            status: 400,
            reason: "mapper_parsing_exception".to_string()
        }
        .is_retryable());
        assert!(!StoreError::InvalidResponse {
            msg: "not json".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_display_includes_status() {
        let err = StoreError::Rejected {
            status: 409,
            reason: "version conflict".to_string(),
        };
        assert!(err.to_string().contains("409"));
        assert!(err.to_string().contains("version conflict"));
    }
}
