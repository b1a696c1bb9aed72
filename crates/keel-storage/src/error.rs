use keel_types::{ErrorCode, KernelError};
use thiserror::Error;

/// Storage-layer errors, mapped to kernel codes at the service boundary.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("immutability violation: {0}")]
    ImmutabilityViolation(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for KernelError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Conflict(detail) => {
                KernelError::new(ErrorCode::ConcurrentInsertConflict, detail)
            }
            StorageError::ImmutabilityViolation(detail) => {
                KernelError::new(ErrorCode::ImmutabilityViolation, detail)
            }
            StorageError::NotFound(detail)
            | StorageError::InvariantViolation(detail)
            | StorageError::InvalidInput(detail)
            | StorageError::Serialization(detail)
            | StorageError::Backend(detail) => {
                KernelError::new(ErrorCode::TransactionFailure, detail)
            }
        }
    }
}
