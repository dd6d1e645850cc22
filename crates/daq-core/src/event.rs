//! Device events originating from executors.
//!
//! Executors forward events raised by the controlled process as opaque
//! messages; the payload is self-describing JSON with a `_messageType`
//! discriminator of `DeviceEvent`.

use serde::{Deserialize, Serialize};

use crate::types::TaskId;

/// Kinds of device events the control plane understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceEventType {
    /// The device exhausted its input; a running environment stops itself.
    EndOfData,
    /// The device left its expected state on its own.
    StateChanged,
}

/// Which task raised the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEventOrigin {
    #[serde(rename = "taskId")]
    pub task_id: TaskId,
    pub hostname: String,
}

/// An event raised by a device, forwarded by its executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    #[serde(rename = "type")]
    pub event_type: DeviceEventType,
    pub origin: DeviceEventOrigin,
}
