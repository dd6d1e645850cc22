//! Task catalog error types.

use daq_core::{TaskId, TaskLifecycle};
use thiserror::Error;

/// Result type alias for task catalog operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors that can occur in the task catalog.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A non-terminal status arrived for a task the catalog never
    /// created. The catalog cannot recover from this; the controller
    /// shuts down.
    #[error("status {lifecycle:?} for unknown task {task_id}")]
    UnknownTask {
        task_id: TaskId,
        lifecycle: TaskLifecycle,
    },

    /// A task references a class missing from the registry.
    #[error("unknown task class {0}")]
    UnknownClass(String),
}
