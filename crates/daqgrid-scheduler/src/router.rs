//! Inbound executor message router.
//!
//! Agent messages are opaque byte payloads, self-describing through a
//! `_messageType` discriminator. The router peeks the discriminator and
//! parses the rest only when it knows what to do with it. Malformed
//! payloads are logged at warning and dropped, never retried.

use serde::Deserialize;
use tracing::{debug, warn};

use daq_core::{AgentId, DeviceEvent, ExecutorId};
use daqgrid_command::{CommandResponse, CommandTarget, TRANSITION_COMMAND};

/// Where a routed message goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Device event for the environment manager.
    Device(DeviceEvent),
    /// Transition response for the command servant, with the sender
    /// tuple rebuilt from the envelope and the response body.
    Transition(CommandResponse, CommandTarget),
}

#[derive(Deserialize)]
struct Discriminator {
    #[serde(rename = "_messageType")]
    message_type: String,
}

#[derive(Deserialize)]
struct ResponseName {
    name: String,
}

/// Classify one inbound payload. `None` means logged-and-dropped.
pub fn route(agent_id: &AgentId, executor_id: &ExecutorId, data: &[u8]) -> Option<Routed> {
    let discriminator: Discriminator = match serde_json::from_slice(data) {
        Ok(d) => d,
        Err(e) => {
            warn!(%agent_id, %executor_id, error = %e, "malformed agent message dropped");
            return None;
        }
    };

    match discriminator.message_type.as_str() {
        "DeviceEvent" => match serde_json::from_slice::<DeviceEvent>(data) {
            Ok(event) => Some(Routed::Device(event)),
            Err(e) => {
                warn!(%agent_id, error = %e, "malformed device event dropped");
                None
            }
        },
        "MesosCommandResponse" => {
            let name: ResponseName = match serde_json::from_slice(data) {
                Ok(n) => n,
                Err(e) => {
                    warn!(%agent_id, error = %e, "malformed command response dropped");
                    return None;
                }
            };
            if name.name != TRANSITION_COMMAND {
                warn!(%agent_id, command = %name.name, "unrecognized command response dropped");
                return None;
            }
            match serde_json::from_slice::<CommandResponse>(data) {
                Ok(response) => {
                    let sender = CommandTarget {
                        agent_id: agent_id.clone(),
                        executor_id: executor_id.clone(),
                        task_id: response.task_id.clone(),
                    };
                    Some(Routed::Transition(response, sender))
                }
                Err(e) => {
                    warn!(%agent_id, error = %e, "malformed transition response dropped");
                    None
                }
            }
        }
        other => {
            debug!(%agent_id, discriminator = %other, "unknown message type dropped");
            None
        }
    }
}
