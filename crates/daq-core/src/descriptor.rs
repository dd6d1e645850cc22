//! Task descriptors and the workload class catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constraint::Constraints;
use crate::resources::ResourceDemand;
use crate::types::EnvironmentId;

/// An immutable request for one task.
///
/// Descriptors are produced by the environment manager when a workflow is
/// deployed, queued for the matcher, and consumed exactly once when a
/// matching offer arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Name of the task class to launch.
    pub class_name: String,
    /// Target role path within the workflow, e.g. `readout/flp-1`.
    pub role_path: String,
    /// Environment this task will belong to.
    pub environment_id: EnvironmentId,
    /// Constraints contributed by the role; combined with the class's.
    #[serde(default)]
    pub role_constraints: Constraints,
}

/// The catalog entry a descriptor's class name refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskClass {
    pub name: String,
    /// Resource demand of one task of this class.
    pub wants: ResourceDemand,
    /// Constraints every task of this class carries.
    #[serde(default)]
    pub constraints: Constraints,
    /// Recipe for the process command line.
    pub command: CommandRecipe,
}

/// How to build the process command line for a task class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecipe {
    /// The executable.
    pub value: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// `NAME=value` pairs for the process environment.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub shell: bool,
}

/// The fully-bound command handed to the executor at launch.
///
/// Serialized to JSON and carried in the launch payload; the executor
/// spawns the process and connects to it on `control_port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCommand {
    pub value: String,
    pub arguments: Vec<String>,
    pub env: Vec<String>,
    pub shell: bool,
    /// Port the executor uses to control the process.
    pub control_port: u16,
    /// Named dynamic ports bound for this task.
    pub bind_ports: BTreeMap<String, u16>,
}

impl CommandRecipe {
    /// Bind the recipe to concrete ports on a concrete host.
    ///
    /// Appends the control port argument and exports the control port,
    /// the role host, and every bound dynamic port through the process
    /// environment.
    pub fn bind(
        &self,
        control_port: u16,
        bind_ports: BTreeMap<String, u16>,
        role_host: &str,
    ) -> TaskCommand {
        let mut arguments = self.arguments.clone();
        arguments.push("--control-port".to_string());
        arguments.push(control_port.to_string());

        let mut env = self.env.clone();
        env.push(format!("DAQ_CONTROL_PORT={control_port}"));
        env.push(format!("DAQ_ROLE={role_host}"));
        for (name, port) in &bind_ports {
            env.push(format!("DAQ_PORT_{}={}", name.to_uppercase(), port));
        }

        TaskCommand {
            value: self.value.clone(),
            arguments,
            env,
            shell: self.shell,
            control_port,
            bind_ports,
        }
    }
}
