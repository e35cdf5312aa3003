use gatehouse_types::WorkflowInstanceId;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// Compare-and-swap lost: the stored version moved since it was read.
    #[error("version conflict on {instance_id}: expected {expected}, found {actual}")]
    VersionConflict {
        instance_id: WorkflowInstanceId,
        expected: u64,
        actual: u64,
    },

    /// An audit record already exists for this idempotency key.
    #[error("duplicate audit record for idempotency key {0}")]
    Duplicate(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}
