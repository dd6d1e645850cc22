//! Scheduler error types.

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can end the controller.
///
/// Transport failures never appear here; the controller absorbs them and
/// re-subscribes under backoff. Only an unresolvable state inconsistency
/// is fatal.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The system state cannot be reconciled with the event stream;
    /// the controller initiates a controlled shutdown.
    #[error("unresolvable state error: {0}")]
    State(String),
}
