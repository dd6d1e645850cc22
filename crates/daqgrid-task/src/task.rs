//! The mutable task record.

use std::collections::BTreeMap;

use daq_core::{AgentId, EnvironmentId, ExecutorId, TaskId, TaskLifecycle};

/// A launched task, owned by the [`TaskManager`](crate::TaskManager) for
/// its whole lifetime. Holds a back-reference to its environment by
/// identifier only.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub class_name: String,
    pub role_path: String,
    pub environment_id: EnvironmentId,
    pub agent_id: AgentId,
    pub executor_id: ExecutorId,
    pub hostname: String,
    /// Named dynamic ports bound at match time.
    pub bind_ports: BTreeMap<String, u16>,
    pub control_port: u16,
    /// Fine-grained state reported by the executor
    /// (standby, configured, running, paused, error, done).
    pub state: String,
    /// Coarse lifecycle reported by the outer manager.
    pub lifecycle: TaskLifecycle,
    /// Set when the lifecycle turned terminal; drives grace-window
    /// removal.
    pub terminal_since: Option<u64>,
}

impl Task {
    /// Human-readable name used in launch operations and logs.
    pub fn name(&self) -> String {
        format!("{}:{}", self.role_path, self.class_name)
    }

    /// Every port this task occupies on its agent.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.bind_ports.values().copied().collect();
        ports.push(self.control_port);
        ports
    }

    pub fn is_terminal(&self) -> bool {
        self.lifecycle.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task() -> Task {
        let mut bind_ports = BTreeMap::new();
        bind_ports.insert("data".to_string(), 10000);
        Task {
            id: "t-1".to_string(),
            class_name: "readout".to_string(),
            role_path: "daq/flp-1".to_string(),
            environment_id: "env-1".to_string(),
            agent_id: "agent-1".to_string(),
            executor_id: "x-1".to_string(),
            hostname: "flp-1".to_string(),
            bind_ports,
            control_port: 47101,
            state: "standby".to_string(),
            lifecycle: TaskLifecycle::Launched,
            terminal_since: None,
        }
    }

    #[test]
    fn name_combines_role_and_class() {
        assert_eq!(make_task().name(), "daq/flp-1:readout");
    }

    #[test]
    fn ports_include_control_port() {
        let ports = make_task().ports();
        assert!(ports.contains(&10000));
        assert!(ports.contains(&47101));
    }
}
