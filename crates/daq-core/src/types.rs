//! Identifier aliases and task lifecycle types.

use serde::{Deserialize, Serialize};

use crate::constraint::Attributes;
use crate::resources::ResourceBundle;

/// Unique identifier for a task (assigned at launch).
pub type TaskId = String;

/// Unique identifier for an agent in the cluster.
pub type AgentId = String;

/// Unique identifier for a per-agent executor process.
pub type ExecutorId = String;

/// Unique identifier for an environment (a deployment of tasks).
pub type EnvironmentId = String;

/// Identifier of a single resource offer, valid for one cycle.
pub type OfferId = String;

// ── Lifecycle ──────────────────────────────────────────────────────

/// Coarse task lifecycle as reported by the outer resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLifecycle {
    /// Launch accepted, process not yet confirmed running.
    Launched,
    Running,
    Finished,
    Lost,
    Killed,
    Failed,
    Error,
}

impl TaskLifecycle {
    /// A terminal lifecycle state is never left again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskLifecycle::Launched | TaskLifecycle::Running)
    }

    /// Terminal states other than a clean finish.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskLifecycle::Lost | TaskLifecycle::Killed | TaskLifecycle::Failed | TaskLifecycle::Error
        )
    }
}

/// A status update delivered by the outer manager for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub lifecycle: TaskLifecycle,
    /// Free-form reason attached by the agent or the outer manager.
    #[serde(default)]
    pub message: String,
}

// ── Offers ────────────────────────────────────────────────────────

/// A short-lived grant of an agent's resources.
///
/// Offers are consumed within the cycle that delivered them: every offer
/// is either accepted with launches or declined before the cycle returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub id: OfferId,
    pub agent_id: AgentId,
    pub hostname: String,
    pub attributes: Attributes,
    pub resources: ResourceBundle,
    /// Executors already running on the agent for this framework.
    pub executor_ids: Vec<ExecutorId>,
}
