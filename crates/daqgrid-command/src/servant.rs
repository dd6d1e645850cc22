//! CommandServant — issues commands and correlates responses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use daqgrid_transport::CallSender;

use crate::command::{
    CommandId, CommandOutcome, CommandResponse, CommandTarget, TargetStatus, TransitionRequest,
};
use crate::error::{CommandError, CommandResult};

struct PendingCommand {
    name: String,
    slots: HashMap<CommandTarget, TargetStatus>,
    outstanding: usize,
    done: Option<oneshot::Sender<()>>,
}

/// Fan-out command coordinator.
///
/// Shared between the environment manager (issuing) and the controller's
/// message router (resolving). The pending map has its own lock, finer
/// grained than the scheduler state mutex.
pub struct CommandServant {
    calls: CallSender,
    pending: Mutex<HashMap<CommandId, PendingCommand>>,
    shutdown: watch::Receiver<bool>,
}

impl CommandServant {
    pub fn new(calls: CallSender, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            calls,
            pending: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Issue `event` to every target and await correlation.
    ///
    /// The command body is serialized once; the command counts as issued
    /// only after every target message was handed to the transport.
    /// Responses may arrive in any order.
    pub async fn send_command(
        &self,
        name: &str,
        event: &str,
        targets: Vec<CommandTarget>,
        timeout: Duration,
    ) -> CommandResult<CommandOutcome> {
        if targets.is_empty() {
            return Ok(CommandOutcome::Ok(HashMap::new()));
        }

        let command_id: CommandId = format!("c-{}", Uuid::new_v4());
        let request = TransitionRequest::new(command_id.clone(), event);
        let payload =
            serde_json::to_vec(&request).map_err(|e| CommandError::Serialize(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending map lock poisoned");
            pending.insert(
                command_id.clone(),
                PendingCommand {
                    name: name.to_string(),
                    slots: targets
                        .iter()
                        .cloned()
                        .map(|t| (t, TargetStatus::Pending))
                        .collect(),
                    outstanding: targets.len(),
                    done: Some(done_tx),
                },
            );
        }

        debug!(%command_id, %event, targets = targets.len(), "dispatching command");
        for target in &targets {
            let delivered = self
                .calls
                .message(
                    target.agent_id.clone(),
                    target.executor_id.clone(),
                    payload.clone(),
                )
                .await;
            if let Err(e) = delivered {
                warn!(%command_id, task_id = %target.task_id, error = %e,
                    "command message undeliverable");
                self.resolve(
                    &command_id,
                    target,
                    TargetStatus::Undeliverable { message: e.to_string() },
                );
            }
        }

        let mut shutdown = self.shutdown.clone();
        let completed = tokio::select! {
            result = done_rx => result.is_ok(),
            _ = sleep_until(deadline) => false,
            _ = shutdown.changed() => {
                return Ok(self.cancel(&command_id));
            }
        };

        let mut pending = self.pending.lock().expect("pending map lock poisoned");
        let Some(entry) = pending.remove(&command_id) else {
            // Resolved and removed concurrently; treat as complete.
            return Ok(CommandOutcome::Ok(HashMap::new()));
        };
        drop(pending);

        let mut slots = entry.slots;
        if completed {
            // Undeliverable targets resolved the slot without responding;
            // that is a partial completion, not a full one.
            if slots.values().all(|s| matches!(s, TargetStatus::Done { .. })) {
                return Ok(CommandOutcome::Ok(slots));
            }
            return Ok(CommandOutcome::Partial(slots));
        }

        let mut responded = 0usize;
        for status in slots.values_mut() {
            match status {
                TargetStatus::Pending => *status = TargetStatus::TimedOut,
                TargetStatus::Done { .. } => responded += 1,
                _ => {}
            }
        }
        warn!(%command_id, name = %entry.name, responded, total = slots.len(),
            "command deadline elapsed");
        if responded > 0 {
            Ok(CommandOutcome::Partial(slots))
        } else {
            Ok(CommandOutcome::Timeout(slots))
        }
    }

    /// Correlate one incoming response with its pending slot.
    ///
    /// Duplicates and responses matching no pending command or target are
    /// logged and discarded; they are never retried.
    pub fn process_response(&self, response: &CommandResponse, sender: CommandTarget) {
        let mut pending = self.pending.lock().expect("pending map lock poisoned");
        let Some(entry) = pending.get_mut(&response.id) else {
            warn!(command_id = %response.id, task_id = %sender.task_id,
                "response matches no pending command, dropped");
            return;
        };
        let Some(slot) = entry.slots.get_mut(&sender) else {
            warn!(command_id = %response.id, task_id = %sender.task_id,
                "response matches no pending target, dropped");
            return;
        };
        if !matches!(slot, TargetStatus::Pending) {
            warn!(command_id = %response.id, task_id = %sender.task_id,
                "duplicate response dropped");
            return;
        }

        *slot = TargetStatus::Done {
            ok: response.ok,
            state: response.current_state.clone(),
            message: response.message.clone(),
        };
        entry.outstanding -= 1;
        debug!(command_id = %response.id, task_id = %sender.task_id,
            outstanding = entry.outstanding, "response correlated");

        if entry.outstanding == 0 {
            if let Some(done) = entry.done.take() {
                let _ = done.send(());
            }
        }
    }

    /// Number of commands awaiting correlation.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map lock poisoned").len()
    }

    fn resolve(&self, command_id: &str, target: &CommandTarget, status: TargetStatus) {
        let mut pending = self.pending.lock().expect("pending map lock poisoned");
        let Some(entry) = pending.get_mut(command_id) else {
            return;
        };
        if let Some(slot) = entry.slots.get_mut(target) {
            if matches!(slot, TargetStatus::Pending) {
                *slot = status;
                entry.outstanding -= 1;
                if entry.outstanding == 0 {
                    if let Some(done) = entry.done.take() {
                        let _ = done.send(());
                    }
                }
            }
        }
    }

    fn cancel(&self, command_id: &str) -> CommandOutcome {
        let mut pending = self.pending.lock().expect("pending map lock poisoned");
        if let Some(mut entry) = pending.remove(command_id) {
            for status in entry.slots.values_mut() {
                if matches!(status, TargetStatus::Pending) {
                    *status = TargetStatus::Cancelled;
                }
            }
            debug!(%command_id, name = %entry.name, "command cancelled by shutdown");
        }
        CommandOutcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daqgrid_transport::{pair, Call};

    fn target(n: u32) -> CommandTarget {
        CommandTarget {
            agent_id: format!("agent-{n}"),
            executor_id: format!("x-{n}"),
            task_id: format!("t-{n}"),
        }
    }

    fn response(command_id: &str, task_id: &str, ok: bool) -> CommandResponse {
        CommandResponse {
            name: crate::TRANSITION_COMMAND.to_string(),
            id: command_id.to_string(),
            task_id: task_id.to_string(),
            current_state: "configured".to_string(),
            ok,
            message: String::new(),
        }
    }

    /// Collect the per-target messages the servant dispatched, returning
    /// the command id from the shared payload.
    async fn drain_messages(
        remote: &mut daqgrid_transport::RemoteEnd,
        expected: usize,
    ) -> (String, Vec<CommandTarget>) {
        let mut command_id = String::new();
        let mut targets = Vec::new();
        for _ in 0..expected {
            match remote.calls.recv().await.unwrap() {
                Call::Message { agent_id, executor_id, data } => {
                    let parsed: serde_json::Value = serde_json::from_slice(&data).unwrap();
                    command_id = parsed["id"].as_str().unwrap().to_string();
                    let task_id = targets.len() + 1;
                    targets.push(CommandTarget {
                        agent_id,
                        executor_id,
                        task_id: format!("t-{task_id}"),
                    });
                }
                other => panic!("expected MESSAGE, got {other:?}"),
            }
        }
        (command_id, targets)
    }

    #[tokio::test]
    async fn completes_ok_when_all_respond() {
        let (conn, mut remote) = pair(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let servant = std::sync::Arc::new(CommandServant::new(conn.calls.clone(), shutdown_rx));

        let servant2 = servant.clone();
        let send = tokio::spawn(async move {
            servant2
                .send_command(
                    crate::TRANSITION_COMMAND,
                    "CONFIGURE",
                    vec![target(1), target(2)],
                    Duration::from_secs(5),
                )
                .await
                .unwrap()
        });

        let (command_id, _) = drain_messages(&mut remote, 2).await;
        servant.process_response(&response(&command_id, "t-1", true), target(1));
        servant.process_response(&response(&command_id, "t-2", true), target(2));

        let outcome = send.await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(servant.pending_count(), 0);
    }

    #[tokio::test]
    async fn partial_when_one_target_is_silent() {
        let (conn, mut remote) = pair(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let servant = std::sync::Arc::new(CommandServant::new(conn.calls.clone(), shutdown_rx));

        let servant2 = servant.clone();
        let send = tokio::spawn(async move {
            servant2
                .send_command(
                    crate::TRANSITION_COMMAND,
                    "CONFIGURE",
                    vec![target(1), target(2), target(3)],
                    Duration::from_millis(200),
                )
                .await
                .unwrap()
        });

        let (command_id, _) = drain_messages(&mut remote, 3).await;
        servant.process_response(&response(&command_id, "t-1", true), target(1));
        servant.process_response(&response(&command_id, "t-2", true), target(2));
        // target 3 never answers.

        let outcome = send.await.unwrap();
        match outcome {
            CommandOutcome::Partial(slots) => {
                assert_eq!(slots[&target(3)], TargetStatus::TimedOut);
                assert!(slots[&target(1)].responded_ok());
            }
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_when_nobody_responds() {
        let (conn, mut remote) = pair(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let servant = CommandServant::new(conn.calls.clone(), shutdown_rx);

        let outcome = tokio::join!(
            servant.send_command(
                crate::TRANSITION_COMMAND,
                "START",
                vec![target(1)],
                Duration::from_millis(100),
            ),
            drain_messages(&mut remote, 1),
        )
        .0
        .unwrap();

        assert!(matches!(outcome, CommandOutcome::Timeout(_)));
    }

    #[tokio::test]
    async fn duplicate_response_is_dropped() {
        let (conn, mut remote) = pair(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let servant = std::sync::Arc::new(CommandServant::new(conn.calls.clone(), shutdown_rx));

        let servant2 = servant.clone();
        let send = tokio::spawn(async move {
            servant2
                .send_command(
                    crate::TRANSITION_COMMAND,
                    "STOP",
                    vec![target(1), target(2)],
                    Duration::from_millis(300),
                )
                .await
                .unwrap()
        });

        let (command_id, _) = drain_messages(&mut remote, 2).await;
        servant.process_response(&response(&command_id, "t-1", true), target(1));
        // Same sender again: dropped, command still waits for target 2.
        servant.process_response(&response(&command_id, "t-1", false), target(1));

        let outcome = send.await.unwrap();
        match outcome {
            CommandOutcome::Partial(slots) => {
                // The duplicate must not have overwritten the first answer.
                assert!(slots[&target(1)].responded_ok());
            }
            other => panic!("expected Partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped() {
        let (conn, _remote) = pair(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let servant = CommandServant::new(conn.calls.clone(), shutdown_rx);

        // Nothing pending at all; must not panic.
        servant.process_response(&response("c-ghost", "t-1", true), target(1));
        assert_eq!(servant.pending_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_correlation() {
        let (conn, mut remote) = pair(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let servant = std::sync::Arc::new(CommandServant::new(conn.calls.clone(), shutdown_rx));

        let servant2 = servant.clone();
        let send = tokio::spawn(async move {
            servant2
                .send_command(
                    crate::TRANSITION_COMMAND,
                    "EXIT",
                    vec![target(1)],
                    Duration::from_secs(30),
                )
                .await
                .unwrap()
        });

        let _ = drain_messages(&mut remote, 1).await;
        shutdown_tx.send(true).unwrap();

        let outcome = send.await.unwrap();
        assert_eq!(outcome, CommandOutcome::Cancelled);
        assert_eq!(servant.pending_count(), 0);
    }

    #[tokio::test]
    async fn empty_target_list_is_ok() {
        let (conn, _remote) = pair(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let servant = CommandServant::new(conn.calls.clone(), shutdown_rx);

        let outcome = servant
            .send_command(crate::TRANSITION_COMMAND, "CONFIGURE", vec![], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Ok(slots) if slots.is_empty()));
    }
}
