//! Error types for the result schema.

use thiserror::Error;

/// A result document failed validation against the declared schema.
///
/// Schema errors are client-caused: they are surfaced synchronously to the
/// caller and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema error on field [{field}]: {reason}")]
pub struct SchemaError {
    /// The field that failed validation.
    pub field: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl SchemaError {
    /// Create a new schema error for `field`.
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
