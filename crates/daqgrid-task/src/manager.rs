//! TaskManager — the task catalog.
//!
//! Creates tasks from matched offers, applies executor-reported state and
//! outer-manager lifecycle updates, and removes terminal tasks after a
//! grace window. All methods are synchronous; callers hold the shared
//! state mutex.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use daq_core::{
    AgentId, Constraints, Descriptor, EnvironmentId, ExecutorId, Offer, ResourceDemand, TaskClass,
    TaskCommand, TaskId, TaskLifecycle, TaskStatus,
};

use crate::agent_cache::{epoch_secs, AgentCache};
use crate::error::{TaskError, TaskResult};
use crate::task::Task;

/// Lifecycle change worth telling the environment manager about.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// The task reached `Running`.
    Running {
        task_id: TaskId,
        environment_id: EnvironmentId,
    },
    /// The task reached a terminal lifecycle state.
    Terminal {
        task_id: TaskId,
        environment_id: EnvironmentId,
        lifecycle: TaskLifecycle,
    },
}

/// Catalog of tasks plus the class registry and the agent cache.
#[derive(Default)]
pub struct TaskManager {
    classes: HashMap<String, TaskClass>,
    tasks: HashMap<TaskId, Task>,
    pub agent_cache: AgentCache,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classes(classes: Vec<TaskClass>) -> Self {
        let mut manager = Self::new();
        for class in classes {
            manager.register_class(class);
        }
        manager
    }

    // ── Class registry ─────────────────────────────────────────────

    pub fn register_class(&mut self, class: TaskClass) {
        debug!(class = %class.name, "task class registered");
        self.classes.insert(class.name.clone(), class);
    }

    pub fn class(&self, name: &str) -> Option<&TaskClass> {
        self.classes.get(name)
    }

    /// The declared resource demand for a descriptor's class.
    ///
    /// `None` when the class is unknown; the matcher skips such
    /// descriptors silently.
    pub fn wants_for_descriptor(&self, descriptor: &Descriptor) -> Option<&ResourceDemand> {
        self.classes.get(&descriptor.class_name).map(|c| &c.wants)
    }

    /// Effective constraint set per descriptor: class ∪ role.
    ///
    /// Returned as a `Vec` parallel to the input batch; the matcher
    /// removes from both in lockstep during its reverse walk.
    pub fn build_descriptor_constraints(&self, descriptors: &[Descriptor]) -> Vec<Constraints> {
        descriptors
            .iter()
            .map(|d| {
                let class_constraints = self
                    .classes
                    .get(&d.class_name)
                    .map(|c| c.constraints.clone())
                    .unwrap_or_default();
                class_constraints.merged_with(&d.role_constraints)
            })
            .collect()
    }

    // ── Task construction ──────────────────────────────────────────

    /// Construct a task for a matched (offer, descriptor) pair.
    ///
    /// Returns `None` only on programmer error (descriptor referencing an
    /// unknown class after the matcher already resolved its demand);
    /// callers treat that as fatal for the descriptor.
    pub fn new_task_for_offer(
        &mut self,
        offer: &Offer,
        descriptor: &Descriptor,
        bind_ports: BTreeMap<String, u16>,
        control_port: u16,
        executor_id: &ExecutorId,
    ) -> Option<Task> {
        if !self.classes.contains_key(&descriptor.class_name) {
            return None;
        }
        let task = Task {
            id: format!("t-{}", Uuid::new_v4()),
            class_name: descriptor.class_name.clone(),
            role_path: descriptor.role_path.clone(),
            environment_id: descriptor.environment_id.clone(),
            agent_id: offer.agent_id.clone(),
            executor_id: executor_id.clone(),
            hostname: offer.hostname.clone(),
            bind_ports,
            control_port,
            state: "standby".to_string(),
            lifecycle: TaskLifecycle::Launched,
            terminal_since: None,
        };
        self.tasks.insert(task.id.clone(), task.clone());
        Some(task)
    }

    /// Resolve the class recipe into the executor launch command.
    pub fn build_task_command(&self, task: &Task) -> TaskResult<TaskCommand> {
        let class = self
            .classes
            .get(&task.class_name)
            .ok_or_else(|| TaskError::UnknownClass(task.class_name.clone()))?;
        Ok(class
            .command
            .bind(task.control_port, task.bind_ports.clone(), &task.hostname))
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn tasks_for_environment(&self, environment_id: &str) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| t.environment_id == environment_id)
            .collect()
    }

    /// (agent, executor, task) triples for command fan-out.
    pub fn task_seats(&self, task_ids: &[TaskId]) -> Vec<(AgentId, ExecutorId, TaskId)> {
        task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|t| (t.agent_id.clone(), t.executor_id.clone(), t.id.clone()))
            .collect()
    }

    /// Ports occupied by live tasks on one agent.
    pub fn ports_on_agent(&self, agent_id: &str) -> Vec<u16> {
        self.tasks
            .values()
            .filter(|t| t.agent_id == agent_id && !t.is_terminal())
            .flat_map(|t| t.ports())
            .collect()
    }

    // ── Updates ────────────────────────────────────────────────────

    /// Fast path: the executor reported a fine-grained state string.
    pub fn update_task_state(&mut self, task_id: &str, state: &str) {
        match self.tasks.get_mut(task_id) {
            Some(task) => {
                debug!(%task_id, %state, "task state updated");
                task.state = state.to_string();
            }
            None => debug!(%task_id, %state, "state update for unknown task dropped"),
        }
    }

    /// Lifecycle transition driven by the outer manager.
    ///
    /// Terminal states freeze the record; later updates for the same task
    /// are dropped, so a terminal task can never appear live again.
    pub fn update_task_status(&mut self, status: &TaskStatus) -> TaskResult<Option<TaskEvent>> {
        let Some(task) = self.tasks.get_mut(&status.task_id) else {
            if status.lifecycle.is_terminal() {
                // Expected after pruning; the outer manager may repeat
                // terminal updates.
                debug!(task_id = %status.task_id, lifecycle = ?status.lifecycle,
                    "terminal update for unknown task dropped");
                return Ok(None);
            }
            return Err(TaskError::UnknownTask {
                task_id: status.task_id.clone(),
                lifecycle: status.lifecycle,
            });
        };

        if task.is_terminal() {
            debug!(task_id = %task.id, lifecycle = ?status.lifecycle,
                "update for terminal task dropped");
            return Ok(None);
        }

        let previous = task.lifecycle;
        task.lifecycle = status.lifecycle;

        if status.lifecycle.is_terminal() {
            task.terminal_since = Some(epoch_secs());
            let level_info = status.lifecycle == TaskLifecycle::Finished;
            if level_info {
                info!(task_id = %task.id, "task finished");
            } else {
                warn!(task_id = %task.id, lifecycle = ?status.lifecycle,
                    message = %status.message, "task inactive");
            }
            return Ok(Some(TaskEvent::Terminal {
                task_id: task.id.clone(),
                environment_id: task.environment_id.clone(),
                lifecycle: status.lifecycle,
            }));
        }

        if status.lifecycle == TaskLifecycle::Running && previous != TaskLifecycle::Running {
            return Ok(Some(TaskEvent::Running {
                task_id: task.id.clone(),
                environment_id: task.environment_id.clone(),
            }));
        }

        Ok(None)
    }

    /// Remove terminal tasks older than the grace window.
    pub fn prune_terminal(&mut self, grace: Duration) -> Vec<TaskId> {
        self.prune_terminal_at(grace, epoch_secs())
    }

    fn prune_terminal_at(&mut self, grace: Duration, now: u64) -> Vec<TaskId> {
        let expired: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| {
                t.terminal_since
                    .is_some_and(|since| now.saturating_sub(since) >= grace.as_secs())
            })
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            self.tasks.remove(id);
            debug!(task_id = %id, "terminal task pruned");
        }
        expired
    }

    /// Remove a task immediately (environment teardown).
    pub fn remove_task(&mut self, task_id: &str) -> Option<Task> {
        self.tasks.remove(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::{
        Attribute, Attributes, BindPort, CommandRecipe, Constraint, PortRange, ResourceBundle,
    };

    fn make_class(name: &str) -> TaskClass {
        TaskClass {
            name: name.to_string(),
            wants: ResourceDemand {
                cpus: 2.0,
                memory_mib: 1024.0,
                static_ports: vec![],
                bind_ports: vec![BindPort::new("data")],
            },
            constraints: Constraints(vec![Constraint::equals("role", "FLP")]),
            command: CommandRecipe {
                value: format!("/opt/daq/{name}"),
                arguments: vec![],
                env: vec![],
                shell: false,
            },
        }
    }

    fn make_offer() -> Offer {
        Offer {
            id: "offer-1".to_string(),
            agent_id: "agent-1".to_string(),
            hostname: "flp-1".to_string(),
            attributes: Attributes(vec![Attribute::new("role", "FLP")]),
            resources: ResourceBundle::new(4.0, 8192.0, vec![PortRange::new(10000, 11000)]),
            executor_ids: vec![],
        }
    }

    fn make_descriptor(class: &str) -> Descriptor {
        Descriptor {
            class_name: class.to_string(),
            role_path: format!("daq/{class}"),
            environment_id: "env-1".to_string(),
            role_constraints: Constraints(vec![Constraint::equals("site", "p2")]),
        }
    }

    fn manager_with_task() -> (TaskManager, Task) {
        let mut manager = TaskManager::with_classes(vec![make_class("readout")]);
        let mut binds = BTreeMap::new();
        binds.insert("data".to_string(), 10000);
        let task = manager
            .new_task_for_offer(
                &make_offer(),
                &make_descriptor("readout"),
                binds,
                47101,
                &"x-1".to_string(),
            )
            .unwrap();
        (manager, task)
    }

    fn status(task_id: &str, lifecycle: TaskLifecycle) -> TaskStatus {
        TaskStatus {
            task_id: task_id.to_string(),
            lifecycle,
            message: String::new(),
        }
    }

    #[test]
    fn wants_for_unknown_class_is_none() {
        let manager = TaskManager::new();
        assert!(manager
            .wants_for_descriptor(&make_descriptor("nope"))
            .is_none());
    }

    #[test]
    fn descriptor_constraints_combine_class_and_role() {
        let manager = TaskManager::with_classes(vec![make_class("readout")]);
        let constraints =
            manager.build_descriptor_constraints(&[make_descriptor("readout")]);
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].0.len(), 2);
    }

    #[test]
    fn new_task_registers_in_catalog() {
        let (manager, task) = manager_with_task();
        assert_eq!(manager.task_count(), 1);
        let stored = manager.get_task(&task.id).unwrap();
        assert_eq!(stored.control_port, 47101);
        assert_eq!(stored.lifecycle, TaskLifecycle::Launched);
        assert_eq!(stored.environment_id, "env-1");
    }

    #[test]
    fn new_task_for_unknown_class_is_none() {
        let mut manager = TaskManager::new();
        let task = manager.new_task_for_offer(
            &make_offer(),
            &make_descriptor("ghost"),
            BTreeMap::new(),
            47101,
            &"x-1".to_string(),
        );
        assert!(task.is_none());
    }

    #[test]
    fn running_update_produces_event() {
        let (mut manager, task) = manager_with_task();
        let event = manager
            .update_task_status(&status(&task.id, TaskLifecycle::Running))
            .unwrap();
        assert_eq!(
            event,
            Some(TaskEvent::Running {
                task_id: task.id.clone(),
                environment_id: "env-1".to_string(),
            })
        );
    }

    #[test]
    fn terminal_update_freezes_the_record() {
        let (mut manager, task) = manager_with_task();
        let event = manager
            .update_task_status(&status(&task.id, TaskLifecycle::Failed))
            .unwrap();
        assert!(matches!(event, Some(TaskEvent::Terminal { .. })));

        // A later non-terminal update must not resurrect the task.
        let event = manager
            .update_task_status(&status(&task.id, TaskLifecycle::Running))
            .unwrap();
        assert!(event.is_none());
        assert_eq!(
            manager.get_task(&task.id).unwrap().lifecycle,
            TaskLifecycle::Failed
        );
    }

    #[test]
    fn nonterminal_update_for_unknown_task_is_fatal() {
        let mut manager = TaskManager::new();
        let result = manager.update_task_status(&status("t-ghost", TaskLifecycle::Running));
        assert!(matches!(result, Err(TaskError::UnknownTask { .. })));
    }

    #[test]
    fn terminal_update_for_unknown_task_is_dropped() {
        let mut manager = TaskManager::new();
        let result = manager.update_task_status(&status("t-ghost", TaskLifecycle::Finished));
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn prune_respects_grace_window() {
        let (mut manager, task) = manager_with_task();
        manager
            .update_task_status(&status(&task.id, TaskLifecycle::Finished))
            .unwrap();

        let since = manager.get_task(&task.id).unwrap().terminal_since.unwrap();
        assert!(manager
            .prune_terminal_at(Duration::from_secs(60), since + 30)
            .is_empty());
        let pruned = manager.prune_terminal_at(Duration::from_secs(60), since + 61);
        assert_eq!(pruned, vec![task.id.clone()]);
        assert!(manager.get_task(&task.id).is_none());
    }

    #[test]
    fn ports_on_agent_skips_terminal_tasks() {
        let (mut manager, task) = manager_with_task();
        assert_eq!(manager.ports_on_agent("agent-1").len(), 2);
        manager
            .update_task_status(&status(&task.id, TaskLifecycle::Killed))
            .unwrap();
        assert!(manager.ports_on_agent("agent-1").is_empty());
    }

    #[test]
    fn task_command_carries_bound_ports() {
        let (manager, task) = manager_with_task();
        let cmd = manager.build_task_command(&task).unwrap();
        assert_eq!(cmd.control_port, 47101);
        assert_eq!(cmd.bind_ports.get("data"), Some(&10000));
        assert_eq!(cmd.value, "/opt/daq/readout");
        assert!(cmd.env.contains(&"DAQ_ROLE=flp-1".to_string()));
    }
}
