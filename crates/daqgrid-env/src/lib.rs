//! daqgrid-env — environments and their state machines.
//!
//! An environment is an operator-visible deployment: a workflow resolved
//! into tasks plus one finite-state machine. The
//! [`EnvironmentManager`]:
//!
//! - resolves workflows into descriptors and hands them to the matcher
//!   through the coalescing deploy queue
//! - attaches launched tasks to their environment
//! - drives operator transitions as a phased fan-out over the command
//!   servant, rolling the environment into `Error` on partial results
//! - reacts to device events (END_OF_DATA stops a running environment)
//!   and to unexpected terminal tasks

pub mod environment;
pub mod error;
pub mod manager;
pub mod workflow;

pub use environment::{Environment, EnvironmentAction, EnvironmentState};
pub use error::{EnvError, EnvResult, RepositoryError};
pub use manager::{EnvironmentManager, ReviveRequest};
pub use workflow::{Role, Workflow, WorkflowSource};
