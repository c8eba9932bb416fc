//! Top-level error type for pipeline operations

use crate::model::ModelError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced by pipeline, registry and training operations
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed stage configuration, unknown model kind or invalid
    /// hyperparameter. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The model failed to fit or transform.
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// An explicitly requested project, identity or artifact does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is not available for the configured model.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The input does not satisfy the operation's preconditions.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Internal(format!("blocking task failed: {}", e))
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
