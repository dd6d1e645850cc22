//! Outbound calls and inbound events.

use std::time::Duration;

use daq_core::{AgentId, ExecutorId, Offer, OfferId, ResourceBundle, TaskId, TaskStatus};

/// Identity and registration parameters presented on subscribe.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameworkInfo {
    /// Previously assigned identity; empty on first registration.
    pub id: String,
    pub name: String,
    /// Resource role the framework subscribes under.
    pub role: String,
    /// How long the outer manager holds the identity after a disconnect.
    pub failover_timeout: Duration,
}

/// One task launch inside an ACCEPT operation.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchInfo {
    pub task_id: TaskId,
    /// Human-readable task name (role path + class).
    pub name: String,
    pub agent_id: AgentId,
    pub executor_id: ExecutorId,
    /// Resources claimed from the offer for this task.
    pub resources: ResourceBundle,
    /// Serialized command payload handed to the executor.
    pub data: Vec<u8>,
}

/// Calls the framework issues to the outer resource manager.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Subscribe {
        framework: FrameworkInfo,
    },
    /// Accept one offer, launching zero or more tasks atomically.
    Accept {
        offer_id: OfferId,
        launches: Vec<LaunchInfo>,
    },
    /// Return offers unused this cycle.
    Decline {
        offer_ids: Vec<OfferId>,
    },
    /// Lift any offer filters so new offers flow again.
    Revive,
    Kill {
        task_id: TaskId,
        agent_id: AgentId,
    },
    /// Opaque payload for a per-agent executor.
    Message {
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
    /// Acknowledge a status update. Issued automatically by the
    /// connection on every received UPDATE.
    Acknowledge {
        task_id: TaskId,
    },
}

/// Events delivered on the subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Subscribed {
        framework_id: String,
    },
    Offers {
        offers: Vec<Offer>,
    },
    Update {
        status: TaskStatus,
    },
    /// An agent or executor failed.
    Failure {
        agent_id: Option<AgentId>,
        executor_id: Option<ExecutorId>,
        status: Option<i32>,
    },
    /// Opaque payload from a per-agent executor.
    Message {
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    },
}

impl Event {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Subscribed { .. } => "SUBSCRIBED",
            Event::Offers { .. } => "OFFERS",
            Event::Update { .. } => "UPDATE",
            Event::Failure { .. } => "FAILURE",
            Event::Message { .. } => "MESSAGE",
        }
    }
}
