//! Command servant error types.

use thiserror::Error;

/// Result type alias for command operations.
pub type CommandResult<T> = Result<T, CommandError>;

/// Errors that can occur while issuing a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("cannot serialize command: {0}")]
    Serialize(String),
}
