//! The environment record and its state machine.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use daq_core::{EnvironmentId, TaskId};

use crate::workflow::Workflow;

/// States of the environment machine.
///
/// The vocabulary matches the device-side machine so an environment state
/// is readable as "what every task should report".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentState {
    Standby,
    Configured,
    Running,
    Paused,
    Error,
    Done,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvironmentState::Standby => "standby",
            EnvironmentState::Configured => "configured",
            EnvironmentState::Running => "running",
            EnvironmentState::Paused => "paused",
            EnvironmentState::Error => "error",
            EnvironmentState::Done => "done",
        };
        f.write_str(name)
    }
}

/// Operator actions driving the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentAction {
    Configure,
    Start,
    Stop,
    Reset,
    Exit,
}

impl fmt::Display for EnvironmentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvironmentAction::Configure => "configure",
            EnvironmentAction::Start => "start",
            EnvironmentAction::Stop => "stop",
            EnvironmentAction::Reset => "reset",
            EnvironmentAction::Exit => "exit",
        };
        f.write_str(name)
    }
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy)]
pub struct TransitionPlan {
    pub action: EnvironmentAction,
    /// Event name sent to the device machines.
    pub event: &'static str,
    pub from: &'static [EnvironmentState],
    pub to: EnvironmentState,
}

/// The transition table. `Paused` has no inbound operator action; it is
/// entered from the device side only.
pub fn plan_for(action: EnvironmentAction) -> TransitionPlan {
    use EnvironmentState::*;
    match action {
        EnvironmentAction::Configure => TransitionPlan {
            action,
            event: "CONFIGURE",
            from: &[Standby],
            to: Configured,
        },
        EnvironmentAction::Start => TransitionPlan {
            action,
            event: "START",
            from: &[Configured, Paused],
            to: Running,
        },
        EnvironmentAction::Stop => TransitionPlan {
            action,
            event: "STOP",
            from: &[Running, Paused],
            to: Configured,
        },
        EnvironmentAction::Reset => TransitionPlan {
            action,
            event: "RESET",
            from: &[Configured, Error],
            to: Standby,
        },
        EnvironmentAction::Exit => TransitionPlan {
            action,
            event: "EXIT",
            from: &[Standby, Configured, Error],
            to: Done,
        },
    }
}

/// An operator-visible deployment: a workflow plus its launched tasks and
/// one state machine.
#[derive(Debug, Clone)]
pub struct Environment {
    pub id: EnvironmentId,
    pub workflow: Workflow,
    pub state: EnvironmentState,
    /// Tasks belonging to this environment. Tasks reference back by
    /// identifier only; this set is the owning side.
    pub tasks: HashSet<TaskId>,
    /// Set while a transition is in flight; terminal task events during
    /// a transition are judged by the transition outcome instead.
    pub transitioning: bool,
}

impl Environment {
    pub fn new(id: EnvironmentId, workflow: Workflow) -> Self {
        Self {
            id,
            workflow,
            state: EnvironmentState::Standby,
            tasks: HashSet::new(),
            transitioning: false,
        }
    }

    /// Whether the workflow is fully deployed.
    pub fn fully_deployed(&self) -> bool {
        self.tasks.len() >= self.workflow.roles.len()
    }
}
