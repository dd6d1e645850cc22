//! daq-core — shared domain types for the daqgrid scheduler core.
//!
//! Everything the control plane passes between its subsystems lives here:
//!
//! - Identifier aliases for tasks, agents, executors, environments, offers
//! - Resource bundles and demands with port-range arithmetic
//! - Attribute constraints matched against offer attributes
//! - Task descriptors and task classes (the workload catalog)
//! - Task lifecycle states and status updates
//! - Device events originating from executors
//! - The core configuration record

pub mod config;
pub mod constraint;
pub mod descriptor;
pub mod event;
pub mod resources;
pub mod types;

pub use config::CoreConfig;
pub use constraint::{Attribute, Attributes, Constraint, Constraints};
pub use descriptor::{CommandRecipe, Descriptor, TaskClass, TaskCommand};
pub use event::{DeviceEvent, DeviceEventOrigin, DeviceEventType};
pub use resources::{BindPort, PortRange, ResourceBundle, ResourceDemand};
pub use types::*;
