//! Workflow roles.
//!
//! A workflow is the operator's description of a deployment: a set of
//! roles, each naming the task class to launch and the phase in which the
//! role takes part in coordinated transitions. Phases encode the partial
//! order of state changes the workflow demands (lower phases transition
//! first).

use serde::{Deserialize, Serialize};

use daq_core::{Constraints, Descriptor, EnvironmentId};

use crate::error::RepositoryError;

/// One role of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Role path within the workflow, e.g. `readout/flp-1`.
    pub path: String,
    /// Task class launched for this role.
    pub class_name: String,
    /// Transition ordering group; lower phases are commanded first.
    #[serde(default)]
    pub phase: u32,
    /// Constraints this role adds on top of the class's.
    #[serde(default)]
    pub constraints: Constraints,
}

/// A deployable workflow: a named tree of roles, flattened to leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub roles: Vec<Role>,
}

impl Workflow {
    /// Resolve the workflow into one descriptor per role.
    pub fn descriptors(&self, environment_id: &EnvironmentId) -> Vec<Descriptor> {
        self.roles
            .iter()
            .map(|role| Descriptor {
                class_name: role.class_name.clone(),
                role_path: role.path.clone(),
                environment_id: environment_id.clone(),
                role_constraints: role.constraints.clone(),
            })
            .collect()
    }

    /// Distinct phases in ascending order.
    pub fn phases(&self) -> Vec<u32> {
        let mut phases: Vec<u32> = self.roles.iter().map(|r| r.phase).collect();
        phases.sort_unstable();
        phases.dedup();
        phases
    }

    /// The phase a role path belongs to. Unknown paths land in phase 0.
    pub fn phase_of(&self, role_path: &str) -> u32 {
        self.roles
            .iter()
            .find(|r| r.path == role_path)
            .map(|r| r.phase)
            .unwrap_or(0)
    }
}

/// Collaborator resolving workflow names to workflows.
///
/// The real implementation lives outside the scheduler core (a template
/// repository); the daemon ships a TOML-file source. Load failures are
/// environment-level errors, never fatal to the scheduler.
pub trait WorkflowSource: Send + Sync {
    fn load(&self, name: &str) -> Result<Workflow, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_workflow() -> Workflow {
        Workflow {
            name: "readout-chain".to_string(),
            roles: vec![
                Role {
                    path: "readout/flp-1".to_string(),
                    class_name: "readout".to_string(),
                    phase: 0,
                    constraints: Constraints::default(),
                },
                Role {
                    path: "processing/epn-1".to_string(),
                    class_name: "dpl".to_string(),
                    phase: 1,
                    constraints: Constraints::default(),
                },
                Role {
                    path: "readout/flp-2".to_string(),
                    class_name: "readout".to_string(),
                    phase: 0,
                    constraints: Constraints::default(),
                },
            ],
        }
    }

    #[test]
    fn descriptors_carry_environment_id() {
        let workflow = make_workflow();
        let descriptors = workflow.descriptors(&"env-1".to_string());
        assert_eq!(descriptors.len(), 3);
        assert!(descriptors.iter().all(|d| d.environment_id == "env-1"));
        assert_eq!(descriptors[0].role_path, "readout/flp-1");
    }

    #[test]
    fn phases_are_sorted_and_distinct() {
        assert_eq!(make_workflow().phases(), vec![0, 1]);
    }

    #[test]
    fn phase_lookup() {
        let workflow = make_workflow();
        assert_eq!(workflow.phase_of("processing/epn-1"), 1);
        assert_eq!(workflow.phase_of("unknown/role"), 0);
    }
}
