//! Error types for model backends.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Unknown backend kind: {0}")]
    UnknownKind(String),

    #[error("Load failed: {0}")]
    LoadFailed(String),

    #[error("Model not loaded")]
    NotLoaded,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed model file: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;
