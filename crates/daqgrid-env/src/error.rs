//! Environment error types.

use daqgrid_command::{CommandError, CommandOutcome};
use thiserror::Error;

/// Result type alias for environment operations.
pub type EnvResult<T> = Result<T, EnvError>;

/// Failure surfaced by the external workflow repository collaborator.
///
/// Converted to an environment-level error; never crashes the scheduler.
#[derive(Debug, Error)]
#[error("workflow repository error: {0}")]
pub struct RepositoryError(pub String);

/// Errors that can occur during environment operations.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("environment not found: {0}")]
    NotFound(String),

    #[error("cannot {action} an environment in state {state}")]
    InvalidTransition { action: String, state: String },

    #[error("{pending} of {total} tasks not running yet")]
    TasksNotReady { pending: usize, total: usize },

    /// A transition phase ended without every target confirming; the
    /// environment was rolled into its error state. The outcome carries
    /// the per-target statuses for inspection.
    #[error("transition {action} ended {kind}", kind = .outcome.kind())]
    TransitionFailed {
        action: String,
        outcome: CommandOutcome,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),
}
