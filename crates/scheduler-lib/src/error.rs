//! Engine error types.

use thiserror::Error;

/// Errors surfaced at the API boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed configuration or manual override; no state was mutated.
    #[error("validation error: {0}")]
    Validation(String),

    /// No session exists for the requested key.
    #[error("schedule {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// The session exists but has not produced its first snapshot yet.
    #[error("schedule {namespace}/{name} is not ready")]
    Pending { namespace: String, name: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
