//! Command wire types and outcomes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use daq_core::{AgentId, ExecutorId, TaskId};

/// Unique identifier of one issued command.
pub type CommandId = String;

/// Name of the transition command understood by executors.
pub const TRANSITION_COMMAND: &str = "MesosCommand_Transition";

/// One (agent, executor, task) recipient of a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandTarget {
    pub agent_id: AgentId,
    pub executor_id: ExecutorId,
    pub task_id: TaskId,
}

/// Outgoing transition command payload.
///
/// Serialized once per command; the identical body goes to every target.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRequest {
    #[serde(rename = "_messageType")]
    pub message_type: String,
    pub name: String,
    pub id: CommandId,
    /// Transition event the device machine should take
    /// (CONFIGURE, START, STOP, RESET, EXIT).
    pub event: String,
}

impl TransitionRequest {
    pub fn new(id: CommandId, event: &str) -> Self {
        Self {
            message_type: "MesosCommand".to_string(),
            name: TRANSITION_COMMAND.to_string(),
            id,
            event: event.to_string(),
        }
    }
}

/// Incoming response from one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub name: String,
    pub id: CommandId,
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    #[serde(rename = "currentState")]
    pub current_state: String,
    pub ok: bool,
    #[serde(default)]
    pub message: String,
}

/// Per-target resolution of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetStatus {
    /// No response yet.
    Pending,
    /// The target responded.
    Done {
        ok: bool,
        state: String,
        message: String,
    },
    /// The message could not be handed to the transport.
    Undeliverable { message: String },
    /// The deadline elapsed without a response.
    TimedOut,
    /// Shutdown interrupted the correlation.
    Cancelled,
}

impl TargetStatus {
    pub fn responded_ok(&self) -> bool {
        matches!(self, TargetStatus::Done { ok: true, .. })
    }
}

/// How a command completed.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Every target responded before the deadline.
    Ok(HashMap<CommandTarget, TargetStatus>),
    /// Some targets responded, the rest timed out.
    Partial(HashMap<CommandTarget, TargetStatus>),
    /// No target responded before the deadline.
    Timeout(HashMap<CommandTarget, TargetStatus>),
    /// Shutdown interrupted the correlation.
    Cancelled,
}

impl CommandOutcome {
    /// Every target responded and reported success.
    pub fn succeeded(&self) -> bool {
        match self {
            CommandOutcome::Ok(slots) => slots.values().all(TargetStatus::responded_ok),
            _ => false,
        }
    }

    /// Per-target statuses, when the outcome carries them.
    pub fn slots(&self) -> Option<&HashMap<CommandTarget, TargetStatus>> {
        match self {
            CommandOutcome::Ok(slots)
            | CommandOutcome::Partial(slots)
            | CommandOutcome::Timeout(slots) => Some(slots),
            CommandOutcome::Cancelled => None,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandOutcome::Ok(_) => "ok",
            CommandOutcome::Partial(_) => "partial",
            CommandOutcome::Timeout(_) => "timeout",
            CommandOutcome::Cancelled => "cancelled",
        }
    }
}
