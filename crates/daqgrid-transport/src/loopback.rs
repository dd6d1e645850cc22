//! Loopback cluster — a simulated outer manager and executor population.
//!
//! Speaks the [`Call`]/[`Event`] interface over an in-process pair so the
//! whole scheduler core can run without a real cluster. Used by the
//! daemon's loopback mode and by the integration tests.
//!
//! Behavior:
//! - `Subscribe` assigns (or re-confirms) a framework identity, then
//!   emits one offer per agent with its currently available resources
//! - `Accept` books the launched tasks, returns the offer remainder to
//!   the agent, and reports `Launched` then `Running` for every task
//! - `Decline` returns the offered resources in full
//! - `Revive` emits a fresh offer round
//! - Transition messages are answered per hosted task with an `ok`
//!   response, unless the agent is muted
//! - `Kill` reports the task `Killed`

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use daq_core::{
    AgentId, Attributes, DeviceEventType, ExecutorId, Offer, OfferId, ResourceBundle, TaskId,
    TaskLifecycle, TaskStatus,
};

use crate::call::{Call, Event};
use crate::client::{pair, Connector, ManagerConnection, RemoteEnd};
use crate::error::TransportResult;

/// One simulated agent.
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub hostname: String,
    pub attributes: Attributes,
    pub resources: ResourceBundle,
}

impl AgentSpec {
    pub fn agent_id(&self) -> AgentId {
        format!("agent-{}", self.hostname)
    }
}

/// Where a launched task lives.
#[derive(Debug, Clone)]
struct TaskSeat {
    agent_id: AgentId,
    executor_id: ExecutorId,
    hostname: String,
}

#[derive(Default)]
struct ClusterState {
    /// Resources currently free per agent (not on offer).
    available: HashMap<AgentId, ResourceBundle>,
    /// Offers emitted but not yet accepted or declined.
    outstanding: HashMap<OfferId, (AgentId, ResourceBundle)>,
    /// Launched tasks by id.
    tasks: HashMap<TaskId, TaskSeat>,
    /// Agents whose executors never answer transition commands.
    muted: Vec<AgentId>,
    framework_id: Option<String>,
    /// Every framework id presented on subscribe, in order.
    subscribed_ids: Vec<String>,
    /// Live event sender of the current connection.
    events: Option<mpsc::Sender<TransportResult<Event>>>,
    /// Everything the framework called, in order.
    call_log: Vec<Call>,
}

/// The simulated cluster. Cheap to share; all state is internal.
pub struct LoopbackCluster {
    agents: Vec<AgentSpec>,
    state: Mutex<ClusterState>,
}

impl LoopbackCluster {
    pub fn new(agents: Vec<AgentSpec>) -> Arc<Self> {
        let mut available = HashMap::new();
        for agent in &agents {
            available.insert(agent.agent_id(), agent.resources.clone());
        }
        Arc::new(Self {
            agents,
            state: Mutex::new(ClusterState { available, ..ClusterState::default() }),
        })
    }

    /// Executors on this agent stop answering transition commands.
    pub async fn mute_agent(self: &Arc<Self>, hostname: &str) {
        let mut state = self.state.lock().await;
        state.muted.push(format!("agent-{hostname}"));
    }

    /// The identity currently assigned to the framework.
    pub async fn framework_id(self: &Arc<Self>) -> Option<String> {
        self.state.lock().await.framework_id.clone()
    }

    /// Framework ids presented on subscribe, in order.
    pub async fn subscribed_ids(self: &Arc<Self>) -> Vec<String> {
        self.state.lock().await.subscribed_ids.clone()
    }

    /// Snapshot of every call received so far.
    pub async fn call_log(self: &Arc<Self>) -> Vec<Call> {
        self.state.lock().await.call_log.clone()
    }

    /// Tasks currently booked, by id.
    pub async fn task_ids(self: &Arc<Self>) -> Vec<TaskId> {
        self.state.lock().await.tasks.keys().cloned().collect()
    }

    /// Close the live subscription; the framework observes a clean
    /// disconnect and re-subscribes under backoff.
    pub async fn drop_connection(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        state.events = None;
    }

    /// Emit a device event from a launched task.
    pub async fn send_device_event(
        self: &Arc<Self>,
        task_id: &str,
        event_type: DeviceEventType,
    ) -> bool {
        let (seat, events) = {
            let state = self.state.lock().await;
            let Some(seat) = state.tasks.get(task_id).cloned() else {
                return false;
            };
            let Some(events) = state.events.clone() else {
                return false;
            };
            (seat, events)
        };
        let wire_type = match event_type {
            DeviceEventType::EndOfData => "END_OF_DATA",
            DeviceEventType::StateChanged => "STATE_CHANGED",
        };
        let payload = json!({
            "_messageType": "DeviceEvent",
            "type": wire_type,
            "origin": { "taskId": task_id, "hostname": seat.hostname },
        });
        events
            .send(Ok(Event::Message {
                agent_id: seat.agent_id,
                executor_id: seat.executor_id,
                data: payload.to_string().into_bytes(),
            }))
            .await
            .is_ok()
    }

    /// Build a connector handing out connections to this cluster.
    pub fn connector(self: &Arc<Self>) -> LoopbackConnector {
        LoopbackConnector { cluster: Arc::clone(self) }
    }

    async fn open(self: Arc<Self>) -> ManagerConnection {
        let (conn, remote) = pair(64);
        let RemoteEnd { calls, events } = remote;
        {
            let mut state = self.state.lock().await;
            // A reconnect implicitly rescinds offers of the dead cycle.
            let orphaned: Vec<OfferId> = state.outstanding.keys().cloned().collect();
            for offer_id in orphaned {
                if let Some((agent_id, bundle)) = state.outstanding.remove(&offer_id) {
                    merge_into(state.available.entry(agent_id).or_default(), bundle);
                }
            }
            // Holding the only sender here means dropping it closes the
            // framework's event stream (a clean disconnect).
            state.events = Some(events);
        }
        tokio::spawn(self.drive(calls));
        conn
    }

    async fn drive(self: Arc<Self>, mut calls: mpsc::Receiver<Call>) {
        while let Some(call) = calls.recv().await {
            self.handle_call(call).await;
        }
        debug!("loopback connection closed by framework");
    }

    async fn handle_call(self: &Arc<Self>, call: Call) {
        {
            let mut state = self.state.lock().await;
            state.call_log.push(call.clone());
        }
        match call {
            Call::Subscribe { framework } => {
                let assigned = {
                    let mut state = self.state.lock().await;
                    state.subscribed_ids.push(framework.id.clone());
                    let assigned = if framework.id.is_empty() {
                        state
                            .framework_id
                            .clone()
                            .unwrap_or_else(|| format!("fw-{}", Uuid::new_v4()))
                    } else {
                        framework.id.clone()
                    };
                    state.framework_id = Some(assigned.clone());
                    assigned
                };
                self.emit(Event::Subscribed { framework_id: assigned }).await;
                self.emit_offer_round().await;
            }
            Call::Revive => {
                self.emit_offer_round().await;
            }
            Call::Accept { offer_id, launches } => {
                let mut updates = Vec::new();
                {
                    let mut state = self.state.lock().await;
                    let Some((agent_id, mut bundle)) = state.outstanding.remove(&offer_id) else {
                        warn!(%offer_id, "ACCEPT for unknown offer");
                        return;
                    };
                    for launch in launches {
                        bundle.subtract_scalars(launch.resources.cpus, launch.resources.memory_mib);
                        for range in &launch.resources.ports {
                            bundle.claim_range(*range);
                        }
                        let hostname = self
                            .agents
                            .iter()
                            .find(|a| a.agent_id() == agent_id)
                            .map(|a| a.hostname.clone())
                            .unwrap_or_default();
                        state.tasks.insert(
                            launch.task_id.clone(),
                            TaskSeat {
                                agent_id: agent_id.clone(),
                                executor_id: launch.executor_id.clone(),
                                hostname,
                            },
                        );
                        updates.push(launch.task_id);
                    }
                    merge_into(state.available.entry(agent_id).or_default(), bundle);
                }
                for task_id in updates {
                    self.emit_update(&task_id, TaskLifecycle::Launched).await;
                    self.emit_update(&task_id, TaskLifecycle::Running).await;
                }
            }
            Call::Decline { offer_ids } => {
                let mut state = self.state.lock().await;
                for offer_id in offer_ids {
                    if let Some((agent_id, bundle)) = state.outstanding.remove(&offer_id) {
                        merge_into(state.available.entry(agent_id).or_default(), bundle);
                    }
                }
            }
            Call::Kill { task_id, .. } => {
                {
                    let mut state = self.state.lock().await;
                    state.tasks.remove(&task_id);
                }
                self.emit_update(&task_id, TaskLifecycle::Killed).await;
            }
            Call::Message { agent_id, executor_id, data } => {
                self.answer_executor_message(agent_id, executor_id, data).await;
            }
            Call::Acknowledge { .. } => {}
        }
    }

    /// Answer a transition command on behalf of the hosted executors.
    async fn answer_executor_message(
        self: &Arc<Self>,
        agent_id: AgentId,
        executor_id: ExecutorId,
        data: Vec<u8>,
    ) {
        let parsed: serde_json::Value = match serde_json::from_slice(&data) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "loopback executor got malformed message");
                return;
            }
        };
        if parsed.get("name").and_then(|v| v.as_str()) != Some("MesosCommand_Transition") {
            debug!("loopback executor ignoring non-transition message");
            return;
        }
        let command_id = parsed.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        let event = parsed.get("event").and_then(|v| v.as_str()).unwrap_or_default();

        let hosted: Vec<TaskId> = {
            let state = self.state.lock().await;
            if state.muted.contains(&agent_id) {
                debug!(%agent_id, "muted agent swallows transition command");
                return;
            }
            state
                .tasks
                .iter()
                .filter(|(_, seat)| seat.agent_id == agent_id && seat.executor_id == executor_id)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for task_id in hosted {
            let response = json!({
                "_messageType": "MesosCommandResponse",
                "name": "MesosCommand_Transition",
                "id": command_id,
                "taskId": task_id,
                "currentState": state_after(event),
                "ok": true,
                "message": "",
            });
            self.emit(Event::Message {
                agent_id: agent_id.clone(),
                executor_id: executor_id.clone(),
                data: response.to_string().into_bytes(),
            })
            .await;
        }
    }

    async fn emit_offer_round(self: &Arc<Self>) {
        let offers = {
            let mut state = self.state.lock().await;
            let mut offers = Vec::new();
            for agent in &self.agents {
                let agent_id = agent.agent_id();
                let Some(bundle) = state.available.get(&agent_id).cloned() else {
                    continue;
                };
                if bundle.cpus <= 0.0 && bundle.total_ports() == 0 {
                    continue;
                }
                let offer_id = format!("offer-{}", Uuid::new_v4());
                state.available.remove(&agent_id);
                state
                    .outstanding
                    .insert(offer_id.clone(), (agent_id.clone(), bundle.clone()));
                offers.push(Offer {
                    id: offer_id,
                    agent_id,
                    hostname: agent.hostname.clone(),
                    attributes: agent.attributes.clone(),
                    resources: bundle,
                    executor_ids: Vec::new(),
                });
            }
            offers
        };
        if !offers.is_empty() {
            self.emit(Event::Offers { offers }).await;
        }
    }

    async fn emit_update(self: &Arc<Self>, task_id: &str, lifecycle: TaskLifecycle) {
        self.emit(Event::Update {
            status: TaskStatus {
                task_id: task_id.to_string(),
                lifecycle,
                message: String::new(),
            },
        })
        .await;
    }

    async fn emit(self: &Arc<Self>, event: Event) {
        let sender = { self.state.lock().await.events.clone() };
        if let Some(sender) = sender {
            if sender.send(Ok(event)).await.is_err() {
                debug!("loopback event dropped, connection gone");
            }
        }
    }
}

/// What the device reports after completing a transition event.
fn state_after(event: &str) -> &'static str {
    match event {
        "CONFIGURE" => "configured",
        "START" => "running",
        "STOP" => "configured",
        "RESET" => "standby",
        "EXIT" => "done",
        "GO_ERROR" => "error",
        _ => "standby",
    }
}

fn merge_into(target: &mut ResourceBundle, bundle: ResourceBundle) {
    target.cpus += bundle.cpus;
    target.memory_mib += bundle.memory_mib;
    target.ports.extend(bundle.ports);
}

/// Connector handing out loopback connections.
pub struct LoopbackConnector {
    cluster: Arc<LoopbackCluster>,
}

#[async_trait::async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> TransportResult<ManagerConnection> {
        Ok(Arc::clone(&self.cluster).open().await)
    }
}
