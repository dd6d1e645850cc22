//! Scheduler controller — connection lifecycle and event dispatch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use daq_core::{CoreConfig, TaskLifecycle};
use daqgrid_command::CommandServant;
use daqgrid_env::{EnvironmentManager, ReviveRequest};
use daqgrid_state::IdentityStore;
use daqgrid_task::{SharedTaskManager, TaskError};
use daqgrid_transport::{
    Call, CallSender, Connector, Event, FrameworkInfo, ManagerConnection, TransportError,
};

use crate::backoff::Backoff;
use crate::error::{SchedulerError, SchedulerResult};
use crate::matcher::OfferMatcher;
use crate::metrics::SchedulerMetrics;
use crate::router::{route, Routed};

/// Notifications for the outer machine (the daemon).
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Subscription established; fired on every successful subscribe.
    Connected { framework_id: String },
}

/// Runs the subscribe loop: connect, subscribe, dispatch events, and on
/// termination decide between reconnect (under backoff) and shutdown.
pub struct Controller<C: Connector> {
    pub connector: C,
    pub identity: IdentityStore,
    pub tasks: SharedTaskManager,
    pub environments: Arc<EnvironmentManager>,
    pub servant: Arc<CommandServant>,
    pub matcher: OfferMatcher,
    /// Long-lived call handle rebound to every new subscription; the
    /// servant and the environment manager share it.
    pub shared_calls: CallSender,
    pub config: CoreConfig,
    pub metrics: Arc<SchedulerMetrics>,
    pub shutdown: watch::Receiver<bool>,
    pub sched_events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl<C: Connector> Controller<C> {
    /// Run until shutdown or a fatal state error.
    pub async fn run(mut self) -> SchedulerResult<()> {
        let mut backoff = Backoff::new(
            self.config.registration_min_backoff(),
            self.config.registration_max_backoff(),
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let mut conn = match self.connector.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "cannot reach resource manager");
                    if !self.wait_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };
            self.shared_calls.rebind(&conn.calls);

            let framework = FrameworkInfo {
                id: self.identity.read_or_empty(),
                name: self.config.framework_name.clone(),
                role: self.config.role.clone(),
                failover_timeout: self.config.failover_timeout(),
            };
            debug!(framework_id = %framework.id, "subscribing");
            if let Err(e) = conn.calls.call(Call::Subscribe { framework }).await {
                warn!(error = %e, "subscribe call failed");
                if !self.wait_backoff(&mut backoff).await {
                    break;
                }
                continue;
            }

            match self.consume_events(&mut conn, &mut backoff).await? {
                Termination::Shutdown => break,
                Termination::Disconnected => {
                    info!("disconnected");
                }
                Termination::Transport(message) => {
                    error!(error = %message, "subscription terminated");
                }
            }

            if !self.wait_backoff(&mut backoff).await {
                break;
            }
        }

        info!("controller stopped");
        Ok(())
    }

    /// Drain one subscription until it terminates.
    async fn consume_events(
        &mut self,
        conn: &mut ManagerConnection,
        backoff: &mut Backoff,
    ) -> SchedulerResult<Termination> {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("shutdown requested");
                    return Ok(Termination::Shutdown);
                }
                event = conn.recv() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(TransportError::Disconnected) => return Ok(Termination::Disconnected),
                Err(TransportError::Transport(message)) => {
                    return Ok(Termination::Transport(message))
                }
                Err(TransportError::Protocol(message)) => {
                    // The stream itself is inconsistent; treat as fatal.
                    return Err(SchedulerError::State(message));
                }
            };

            self.metrics.add_events(1);
            if self.config.verbose {
                debug!(event = event.kind(), "incoming event");
            }
            self.dispatch(event, conn, backoff).await?;
        }
    }

    async fn dispatch(
        &mut self,
        event: Event,
        conn: &mut ManagerConnection,
        backoff: &mut Backoff,
    ) -> SchedulerResult<()> {
        match event {
            Event::Subscribed { framework_id } => {
                if let Err(e) = self.identity.remember(&framework_id) {
                    // Losing the identity only costs a re-registration
                    // after the failover timeout.
                    warn!(error = %e, "cannot persist framework identity");
                }
                backoff.reset();
                info!(%framework_id, "subscribed");
                let _ = self
                    .sched_events
                    .send(SchedulerEvent::Connected { framework_id });
            }

            Event::Offers { offers } => {
                self.matcher.handle_offers(offers, &conn.calls).await;
            }

            Event::Update { status } => {
                // Acknowledged already by the connection.
                let update = {
                    let mut tasks = self.tasks.lock().expect("state lock poisoned");
                    let result = tasks.update_task_status(&status);
                    tasks.prune_terminal(self.config.terminal_grace());
                    result
                };
                if status.lifecycle == TaskLifecycle::Finished {
                    self.metrics.add_finished(1);
                }
                match update {
                    Ok(Some(task_event)) => {
                        self.environments.handle_task_event(&task_event).await;
                    }
                    Ok(None) => {}
                    Err(TaskError::UnknownTask { task_id, lifecycle }) => {
                        return Err(SchedulerError::State(format!(
                            "status {lifecycle:?} for unknown task {task_id}"
                        )));
                    }
                    Err(e) => warn!(error = %e, "status update not applied"),
                }
            }

            Event::Message { agent_id, executor_id, data } => {
                match route(&agent_id, &executor_id, &data) {
                    Some(Routed::Device(device_event)) => {
                        self.environments.handle_device_event(&device_event).await;
                    }
                    Some(Routed::Transition(response, sender)) => {
                        {
                            let mut tasks =
                                self.tasks.lock().expect("state lock poisoned");
                            tasks.update_task_state(&response.task_id, &response.current_state);
                        }
                        self.servant.process_response(&response, sender);
                    }
                    None => self.metrics.add_dropped_message(),
                }
            }

            Event::Failure { agent_id, executor_id, status } => {
                match (&executor_id, &agent_id) {
                    (Some(executor), agent) => {
                        error!(%executor, agent = agent.as_deref().unwrap_or("-"),
                            status = status.unwrap_or_default(), "executor failed");
                    }
                    (None, Some(agent)) => {
                        error!(%agent, "agent failed");
                        let tasks = self.tasks.lock().expect("state lock poisoned");
                        tasks.agent_cache.evict(agent);
                    }
                    (None, None) => warn!("failure event without a subject"),
                }
            }
        }
        Ok(())
    }

    /// Rate-limit re-subscription. Returns false when shutting down.
    async fn wait_backoff(&mut self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next();
        debug!(?delay, "re-subscription backoff");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.changed() => false,
        }
    }
}

enum Termination {
    Shutdown,
    Disconnected,
    Transport(String),
}

/// Consume revive requests, throttled by a token bucket.
///
/// The bucket is a capacity-one channel refilled by a timer: one token
/// per elapsed interval, at most one banked. A request finding no token
/// is acknowledged without a REVIVE call.
pub async fn run_revive_loop(
    calls: CallSender,
    mut requests: mpsc::Receiver<ReviveRequest>,
    rate: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let (token_tx, mut token_rx) = mpsc::channel::<()>(1);
    let mut refill = tokio::time::interval(rate.max(Duration::from_millis(1)));

    loop {
        // Biased so a due refill lands before the request that needs it.
        tokio::select! {
            biased;
            _ = refill.tick() => {
                // Full bucket just drops the token.
                let _ = token_tx.try_send(());
            }
            request = requests.recv() => {
                let Some(ack) = request else { break };
                match token_rx.try_recv() {
                    Ok(()) => match calls.revive().await {
                        Ok(()) => debug!("revive offers done"),
                        Err(e) => warn!(error = %e, "failed to revive offers"),
                    },
                    Err(_) => debug!("revive request throttled"),
                }
                let _ = ack.send(());
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("revive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    use daqgrid_transport::pair;

    #[tokio::test]
    async fn revive_loop_forwards_and_acks() {
        let (conn, mut remote) = pair(8);
        let (request_tx, request_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_revive_loop(
            conn.calls.clone(),
            request_rx,
            Duration::from_millis(10),
            shutdown_rx,
        ));

        let (ack_tx, ack_rx) = oneshot::channel();
        request_tx.send(ack_tx).await.unwrap();
        ack_rx.await.unwrap();

        assert_eq!(remote.calls.recv().await.unwrap(), Call::Revive);
    }

    #[tokio::test]
    async fn revive_loop_throttles_bursts() {
        let (conn, mut remote) = pair(8);
        let (request_tx, request_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // A long refill interval: only the startup token is available.
        tokio::spawn(run_revive_loop(
            conn.calls.clone(),
            request_rx,
            Duration::from_secs(3600),
            shutdown_rx,
        ));

        for _ in 0..3 {
            let (ack_tx, ack_rx) = oneshot::channel();
            request_tx.send(ack_tx).await.unwrap();
            ack_rx.await.unwrap();
        }

        // Exactly one REVIVE went out; the rest were throttled but acked.
        assert_eq!(remote.calls.try_recv().ok(), Some(Call::Revive));
        assert!(remote.calls.try_recv().is_err());
    }
}
