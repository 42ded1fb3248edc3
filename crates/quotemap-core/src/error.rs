//! Error type for engine and quote-service operations.
//!
//! Store and embedding backends report failures as [`anyhow::Error`]; the
//! engine wraps them so callers (CLI, HTTP) can tell a busy engine or a
//! missing quote apart from an infrastructure failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Another recompute holds the lease. Retry later.
    #[error("recompute already running")]
    Busy,

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("embedding dimension mismatch for {id}: expected {expected}, got {actual}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The embedding provider failed (transport or availability).
    #[error("embedding provider unavailable: {0}")]
    Embedding(#[source] anyhow::Error),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl EngineError {
    pub fn quote_not_found(id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind: "quote",
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidParameter(message.into())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
