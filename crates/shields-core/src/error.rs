//! Error types for Shields core

use thiserror::Error;

/// Errors that can occur in Shields core
#[derive(Debug, Error)]
pub enum ShieldsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compile error for {target}: {reason}")]
    Compile { target: String, reason: String },

    #[error("Cache load error: {0}")]
    CacheLoad(String),

    #[error("Rule list not found: {0}")]
    NotFound(String),

    #[error("Background worker failed: {0}")]
    WorkerFailed(String),
}

impl ShieldsError {
    pub(crate) fn compile(target: impl ToString, reason: impl ToString) -> Self {
        ShieldsError::Compile {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Expected conditions that callers treat as "nothing here" rather than
    /// a failure
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ShieldsError::NotFound(_) | ShieldsError::CacheLoad(_))
    }
}

impl From<serde_json::Error> for ShieldsError {
    fn from(error: serde_json::Error) -> Self {
        ShieldsError::Serialization(error.to_string())
    }
}

impl From<tokio::task::JoinError> for ShieldsError {
    fn from(error: tokio::task::JoinError) -> Self {
        ShieldsError::WorkerFailed(error.to_string())
    }
}
