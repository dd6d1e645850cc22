//! Error types for the identity store.

use thiserror::Error;

/// Result type alias for identity store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while persisting or reading the identity.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),
}
