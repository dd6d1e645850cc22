//! EnvironmentManager — owns every environment and drives transitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use daq_core::{Descriptor, DeviceEvent, DeviceEventType, EnvironmentId, TaskId, TaskLifecycle};
use daqgrid_command::{CommandOutcome, CommandServant, CommandTarget, TRANSITION_COMMAND};
use daqgrid_task::{DeployQueue, SharedTaskManager, TaskEvent};
use daqgrid_transport::CallSender;

use crate::environment::{plan_for, Environment, EnvironmentAction, EnvironmentState};
use crate::error::{EnvError, EnvResult};
use crate::workflow::{Workflow, WorkflowSource};

/// A revive request: the controller acknowledges by completing the
/// oneshot, giving the sender a cheap barrier.
pub type ReviveRequest = oneshot::Sender<()>;

/// Owns environments and coordinates their lifecycle.
pub struct EnvironmentManager {
    environments: Mutex<HashMap<EnvironmentId, Environment>>,
    tasks: SharedTaskManager,
    servant: Arc<CommandServant>,
    calls: CallSender,
    deploy_queue: Arc<DeployQueue>,
    revive_tx: mpsc::Sender<ReviveRequest>,
    transition_timeout: Duration,
}

impl EnvironmentManager {
    pub fn new(
        tasks: SharedTaskManager,
        servant: Arc<CommandServant>,
        calls: CallSender,
        deploy_queue: Arc<DeployQueue>,
        revive_tx: mpsc::Sender<ReviveRequest>,
        transition_timeout: Duration,
    ) -> Self {
        Self {
            environments: Mutex::new(HashMap::new()),
            tasks,
            servant,
            calls,
            deploy_queue,
            revive_tx,
            transition_timeout,
        }
    }

    // ── Creation and deployment ────────────────────────────────────

    /// Create an environment for a workflow. Starts in `standby`.
    pub async fn create(&self, workflow: Workflow) -> EnvironmentId {
        let id = format!("env-{}", Uuid::new_v4());
        let mut envs = self.environments.lock().await;
        envs.insert(id.clone(), Environment::new(id.clone(), workflow));
        info!(environment_id = %id, "environment created");
        id
    }

    /// Create an environment from a named workflow in the repository.
    ///
    /// Repository failures surface as an environment-level error and
    /// never crash the scheduler.
    pub async fn create_from_source(
        &self,
        source: &dyn WorkflowSource,
        name: &str,
    ) -> EnvResult<EnvironmentId> {
        let workflow = source.load(name)?;
        Ok(self.create(workflow).await)
    }

    /// Queue the environment's descriptors for the next offers cycle and
    /// ask the controller to revive offers.
    pub async fn deploy(&self, environment_id: &str) -> EnvResult<()> {
        let descriptors: Vec<Descriptor> = {
            let envs = self.environments.lock().await;
            let env = envs
                .get(environment_id)
                .ok_or_else(|| EnvError::NotFound(environment_id.to_string()))?;
            if env.state != EnvironmentState::Standby {
                return Err(EnvError::InvalidTransition {
                    action: "deploy".to_string(),
                    state: env.state.to_string(),
                });
            }
            env.workflow.descriptors(&env.id)
        };

        info!(
            environment_id,
            descriptors = descriptors.len(),
            "queueing workflow for deployment"
        );
        self.deploy_queue.push(descriptors);

        // Barrier: wait until the controller acknowledged the revive
        // request, so offers are flowing before the caller proceeds.
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.revive_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        } else {
            debug!("revive channel closed, deploy proceeds without revive");
        }
        Ok(())
    }

    /// Attach tasks launched in an offers cycle to their environments.
    pub async fn register_deployed(&self, deployed: HashMap<TaskId, Descriptor>) {
        let mut envs = self.environments.lock().await;
        for (task_id, descriptor) in deployed {
            match envs.get_mut(&descriptor.environment_id) {
                Some(env) => {
                    debug!(environment_id = %env.id, %task_id, "task attached");
                    env.tasks.insert(task_id);
                }
                None => warn!(
                    environment_id = %descriptor.environment_id,
                    %task_id,
                    "deployed task references unknown environment"
                ),
            }
        }
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Drive one operator transition.
    ///
    /// Three-phase protocol: compute the per-task targets and their
    /// workflow-ordered phases, issue one batched servant command per
    /// phase, then commit the new state — or roll the environment into
    /// `error` when any phase ends partial, timed out, or cancelled.
    pub async fn transition(
        &self,
        environment_id: &str,
        action: EnvironmentAction,
    ) -> EnvResult<EnvironmentState> {
        let plan = plan_for(action);

        // Validate, check readiness, group targets by phase, and claim
        // the transition flag, all under the environment lock.
        let phase_groups: Vec<(u32, Vec<CommandTarget>)> = {
            let mut envs = self.environments.lock().await;
            let env = envs
                .get_mut(environment_id)
                .ok_or_else(|| EnvError::NotFound(environment_id.to_string()))?;
            if env.transitioning {
                return Err(EnvError::InvalidTransition {
                    action: action.to_string(),
                    state: format!("{} (transition in progress)", env.state),
                });
            }
            if !plan.from.contains(&env.state) {
                return Err(EnvError::InvalidTransition {
                    action: action.to_string(),
                    state: env.state.to_string(),
                });
            }

            let tasks = self.tasks.lock().expect("state lock poisoned");

            if matches!(action, EnvironmentAction::Configure | EnvironmentAction::Start) {
                let total = env.workflow.roles.len();
                let running = env
                    .tasks
                    .iter()
                    .filter_map(|id| tasks.get_task(id))
                    .filter(|t| t.lifecycle == TaskLifecycle::Running)
                    .count();
                if !env.fully_deployed() || running < env.tasks.len() {
                    return Err(EnvError::TasksNotReady {
                        pending: total.saturating_sub(running),
                        total,
                    });
                }
            }

            let mut groups: BTreeMap<u32, Vec<CommandTarget>> = BTreeMap::new();
            for task_id in &env.tasks {
                let Some(task) = tasks.get_task(task_id) else {
                    continue;
                };
                if task.is_terminal() {
                    continue;
                }
                groups
                    .entry(env.workflow.phase_of(&task.role_path))
                    .or_default()
                    .push(CommandTarget {
                        agent_id: task.agent_id.clone(),
                        executor_id: task.executor_id.clone(),
                        task_id: task.id.clone(),
                    });
            }
            env.transitioning = true;
            groups.into_iter().collect()
        };

        info!(environment_id, action = %action, phases = phase_groups.len(), "transition started");

        let mut failed: Option<CommandOutcome> = None;
        for (phase, targets) in phase_groups {
            debug!(environment_id, phase, targets = targets.len(), "transition phase");
            let outcome = self
                .servant
                .send_command(TRANSITION_COMMAND, plan.event, targets, self.transition_timeout)
                .await?;
            if !outcome.succeeded() {
                failed = Some(outcome);
                break;
            }
        }

        let mut envs = self.environments.lock().await;
        let env = envs
            .get_mut(environment_id)
            .ok_or_else(|| EnvError::NotFound(environment_id.to_string()))?;
        env.transitioning = false;
        match failed {
            None => {
                env.state = plan.to;
                info!(environment_id, state = %env.state, "transition complete");
                Ok(env.state)
            }
            Some(outcome) => {
                env.state = EnvironmentState::Error;
                warn!(environment_id, action = %action, outcome = outcome.kind(),
                    "transition failed, environment in error");
                Err(EnvError::TransitionFailed {
                    action: action.to_string(),
                    outcome,
                })
            }
        }
    }

    // ── Event intake ───────────────────────────────────────────────

    /// React to a task lifecycle event from the task manager.
    ///
    /// A terminal task outside a transition forces the environment into
    /// `error`; during a transition the command outcome is the judge.
    pub async fn handle_task_event(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Running { task_id, environment_id } => {
                debug!(%environment_id, %task_id, "task running");
            }
            TaskEvent::Terminal { task_id, environment_id, lifecycle } => {
                let mut envs = self.environments.lock().await;
                let Some(env) = envs.get_mut(environment_id) else {
                    debug!(%environment_id, %task_id, "terminal task for unknown environment");
                    return;
                };
                env.tasks.remove(task_id);
                if env.transitioning || env.state == EnvironmentState::Done {
                    debug!(%environment_id, %task_id, ?lifecycle, "terminal task absorbed");
                    return;
                }
                warn!(%environment_id, %task_id, ?lifecycle,
                    "unexpected terminal task, environment in error");
                env.state = EnvironmentState::Error;
            }
        }
    }

    /// React to a device event forwarded by an executor.
    ///
    /// END_OF_DATA from any task of a running environment initiates the
    /// stop transition without operator involvement. The transition runs
    /// detached so the caller's event loop keeps draining responses.
    pub async fn handle_device_event(self: &Arc<Self>, event: &DeviceEvent) {
        match event.event_type {
            DeviceEventType::EndOfData => {
                let task_id = &event.origin.task_id;
                let environment_id = {
                    let tasks = self.tasks.lock().expect("state lock poisoned");
                    tasks.get_task(task_id).map(|t| t.environment_id.clone())
                };
                let Some(environment_id) = environment_id else {
                    warn!(%task_id, "device event for unknown task dropped");
                    return;
                };
                let is_running = {
                    let envs = self.environments.lock().await;
                    envs.get(&environment_id)
                        .map(|e| e.state == EnvironmentState::Running && !e.transitioning)
                        .unwrap_or(false)
                };
                if !is_running {
                    debug!(%environment_id, %task_id, "end of data outside running, ignored");
                    return;
                }
                info!(%environment_id, %task_id, "end of data, stopping environment");
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = manager
                        .transition(&environment_id, EnvironmentAction::Stop)
                        .await
                    {
                        error!(%environment_id, error = %e, "cannot stop after end of data");
                    }
                });
            }
            DeviceEventType::StateChanged => {
                debug!(task_id = %event.origin.task_id, "device state change noted");
            }
        }
    }

    // ── Teardown ───────────────────────────────────────────────────

    /// Tear an environment down: exit its tasks where the machine allows
    /// it, kill whatever is still live, and forget the environment.
    pub async fn destroy(&self, environment_id: &str) -> EnvResult<()> {
        let state = self
            .state_of(environment_id)
            .await
            .ok_or_else(|| EnvError::NotFound(environment_id.to_string()))?;

        if plan_for(EnvironmentAction::Exit).from.contains(&state) {
            if let Err(e) = self.transition(environment_id, EnvironmentAction::Exit).await {
                warn!(environment_id, error = %e, "exit during teardown failed, killing tasks");
            }
        }

        let leftovers: Vec<(TaskId, String)> = {
            let envs = self.environments.lock().await;
            let Some(env) = envs.get(environment_id) else {
                return Ok(());
            };
            let tasks = self.tasks.lock().expect("state lock poisoned");
            env.tasks
                .iter()
                .filter_map(|id| tasks.get_task(id))
                .filter(|t| !t.is_terminal())
                .map(|t| (t.id.clone(), t.agent_id.clone()))
                .collect()
        };

        for (task_id, agent_id) in leftovers {
            info!(environment_id, %task_id, "killing leftover task");
            if let Err(e) = self.calls.kill(task_id.clone(), agent_id).await {
                warn!(%task_id, error = %e, "kill call failed");
            }
        }

        let mut envs = self.environments.lock().await;
        if let Some(env) = envs.remove(environment_id) {
            let mut tasks = self.tasks.lock().expect("state lock poisoned");
            for task_id in &env.tasks {
                tasks.remove_task(task_id);
            }
        }
        info!(environment_id, "environment destroyed");
        Ok(())
    }

    // ── Inspection ─────────────────────────────────────────────────

    pub async fn state_of(&self, environment_id: &str) -> Option<EnvironmentState> {
        let envs = self.environments.lock().await;
        envs.get(environment_id).map(|e| e.state)
    }

    pub async fn task_ids(&self, environment_id: &str) -> Vec<TaskId> {
        let envs = self.environments.lock().await;
        envs.get(environment_id)
            .map(|e| e.tasks.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn environment_ids(&self) -> Vec<EnvironmentId> {
        let envs = self.environments.lock().await;
        envs.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::{
        Attribute, Attributes, CommandRecipe, Constraints, Offer, PortRange, ResourceBundle,
        ResourceDemand, TaskClass, TaskStatus,
    };
    use daqgrid_task::TaskManager;
    use daqgrid_transport::pair;
    use std::collections::BTreeMap;
    use tokio::sync::watch;

    use crate::workflow::Role;

    fn make_class(name: &str) -> TaskClass {
        TaskClass {
            name: name.to_string(),
            wants: ResourceDemand {
                cpus: 1.0,
                memory_mib: 128.0,
                static_ports: vec![],
                bind_ports: vec![],
            },
            constraints: Constraints::default(),
            command: CommandRecipe {
                value: format!("/opt/daq/{name}"),
                arguments: vec![],
                env: vec![],
                shell: false,
            },
        }
    }

    fn make_workflow() -> Workflow {
        Workflow {
            name: "chain".to_string(),
            roles: vec![Role {
                path: "readout/flp-1".to_string(),
                class_name: "readout".to_string(),
                phase: 0,
                constraints: Constraints::default(),
            }],
        }
    }

    fn make_offer(n: u32) -> Offer {
        Offer {
            id: format!("offer-{n}"),
            agent_id: format!("agent-{n}"),
            hostname: format!("flp-{n}"),
            attributes: Attributes(vec![Attribute::new("role", "FLP")]),
            resources: ResourceBundle::new(4.0, 8192.0, vec![PortRange::new(47101, 47200)]),
            executor_ids: vec![],
        }
    }

    struct Fixture {
        manager: Arc<EnvironmentManager>,
        tasks: SharedTaskManager,
        _remote: daqgrid_transport::RemoteEnd,
        _revive_rx: mpsc::Receiver<ReviveRequest>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let (conn, remote) = pair(16);
        let tasks = daqgrid_task::shared(TaskManager::with_classes(vec![make_class("readout")]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let servant = Arc::new(CommandServant::new(conn.calls.clone(), shutdown_rx));
        let (revive_tx, revive_rx) = mpsc::channel(4);
        let manager = Arc::new(EnvironmentManager::new(
            tasks.clone(),
            servant,
            conn.calls.clone(),
            Arc::new(DeployQueue::new()),
            revive_tx,
            Duration::from_millis(200),
        ));
        Fixture {
            manager,
            tasks,
            _remote: remote,
            _revive_rx: revive_rx,
            _shutdown_tx: shutdown_tx,
        }
    }

    /// Launch one catalog task for the environment and mark it running.
    fn launch_task(fixture: &Fixture, environment_id: &str, n: u32) -> TaskId {
        let mut tasks = fixture.tasks.lock().unwrap();
        let descriptor = Descriptor {
            class_name: "readout".to_string(),
            role_path: "readout/flp-1".to_string(),
            environment_id: environment_id.to_string(),
            role_constraints: Constraints::default(),
        };
        let task = tasks
            .new_task_for_offer(&make_offer(n), &descriptor, BTreeMap::new(), 47101, &format!("x-{n}"))
            .unwrap();
        tasks
            .update_task_status(&TaskStatus {
                task_id: task.id.clone(),
                lifecycle: TaskLifecycle::Running,
                message: String::new(),
            })
            .unwrap();
        task.id
    }

    #[tokio::test]
    async fn create_starts_in_standby() {
        let f = fixture();
        let id = f.manager.create(make_workflow()).await;
        assert_eq!(f.manager.state_of(&id).await, Some(EnvironmentState::Standby));
    }

    #[tokio::test]
    async fn configure_requires_deployed_tasks() {
        let f = fixture();
        let id = f.manager.create(make_workflow()).await;
        let result = f.manager.transition(&id, EnvironmentAction::Configure).await;
        assert!(matches!(result, Err(EnvError::TasksNotReady { .. })));
    }

    #[tokio::test]
    async fn start_from_standby_is_invalid() {
        let f = fixture();
        let id = f.manager.create(make_workflow()).await;
        let result = f.manager.transition(&id, EnvironmentAction::Start).await;
        assert!(matches!(result, Err(EnvError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn silent_targets_roll_environment_into_error() {
        let f = fixture();
        let id = f.manager.create(make_workflow()).await;
        let task_id = launch_task(&f, &id, 1);
        f.manager
            .register_deployed(HashMap::from([(
                task_id,
                Descriptor {
                    class_name: "readout".to_string(),
                    role_path: "readout/flp-1".to_string(),
                    environment_id: id.clone(),
                    role_constraints: Constraints::default(),
                },
            )]))
            .await;

        // Nobody answers on the remote end: the phase times out.
        let result = f.manager.transition(&id, EnvironmentAction::Configure).await;
        assert!(matches!(result, Err(EnvError::TransitionFailed { .. })));
        assert_eq!(f.manager.state_of(&id).await, Some(EnvironmentState::Error));
    }

    #[tokio::test]
    async fn unexpected_terminal_task_errors_environment() {
        let f = fixture();
        let id = f.manager.create(make_workflow()).await;
        let task_id = launch_task(&f, &id, 1);
        f.manager
            .register_deployed(HashMap::from([(
                task_id.clone(),
                Descriptor {
                    class_name: "readout".to_string(),
                    role_path: "readout/flp-1".to_string(),
                    environment_id: id.clone(),
                    role_constraints: Constraints::default(),
                },
            )]))
            .await;

        f.manager
            .handle_task_event(&TaskEvent::Terminal {
                task_id,
                environment_id: id.clone(),
                lifecycle: TaskLifecycle::Failed,
            })
            .await;

        assert_eq!(f.manager.state_of(&id).await, Some(EnvironmentState::Error));
    }

    #[tokio::test]
    async fn exit_of_empty_environment_completes() {
        let f = fixture();
        let id = f.manager.create(make_workflow()).await;
        let state = f.manager.transition(&id, EnvironmentAction::Exit).await.unwrap();
        assert_eq!(state, EnvironmentState::Done);
    }

    #[tokio::test]
    async fn reset_recovers_from_error() {
        let f = fixture();
        let id = f.manager.create(make_workflow()).await;
        let task_id = launch_task(&f, &id, 1);
        f.manager
            .handle_task_event(&TaskEvent::Terminal {
                task_id,
                environment_id: id.clone(),
                lifecycle: TaskLifecycle::Lost,
            })
            .await;
        assert_eq!(f.manager.state_of(&id).await, Some(EnvironmentState::Error));

        let state = f.manager.transition(&id, EnvironmentAction::Reset).await.unwrap();
        assert_eq!(state, EnvironmentState::Standby);
    }

    #[tokio::test]
    async fn repository_error_is_not_fatal() {
        struct FailingSource;
        impl WorkflowSource for FailingSource {
            fn load(&self, name: &str) -> Result<Workflow, crate::RepositoryError> {
                Err(crate::RepositoryError(format!("no such template: {name}")))
            }
        }

        let f = fixture();
        let result = f.manager.create_from_source(&FailingSource, "ghost").await;
        assert!(matches!(result, Err(EnvError::Repository(_))));
        assert!(f.manager.environment_ids().await.is_empty());
    }
}
