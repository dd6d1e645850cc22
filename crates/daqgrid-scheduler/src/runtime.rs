//! Core assembly — wires the subsystems into one runnable scheduler.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;

use daq_core::{CoreConfig, TaskClass};
use daqgrid_command::CommandServant;
use daqgrid_env::EnvironmentManager;
use daqgrid_state::IdentityStore;
use daqgrid_task::{DeployQueue, SharedTaskManager, TaskManager};
use daqgrid_transport::{CallSender, Connector};

use crate::controller::{run_revive_loop, Controller, SchedulerEvent};
use crate::matcher::{DeploymentMap, MatchSettings, OfferMatcher};
use crate::metrics::SchedulerMetrics;

/// The assembled scheduler core.
///
/// `controller.run()` drives everything; the other handles stay usable
/// from the outside (the daemon's operator surface, tests).
pub struct Core<C: Connector> {
    pub controller: Controller<C>,
    pub environments: Arc<EnvironmentManager>,
    pub tasks: SharedTaskManager,
    pub metrics: Arc<SchedulerMetrics>,
    pub sched_events: mpsc::UnboundedReceiver<SchedulerEvent>,
}

/// Wire up the scheduler core.
///
/// Spawns the revive consumer loop and the deployed-tasks forwarder;
/// both stop on the shutdown watch.
pub fn assemble<C: Connector>(
    config: CoreConfig,
    classes: Vec<TaskClass>,
    identity: IdentityStore,
    connector: C,
    shutdown: watch::Receiver<bool>,
) -> Core<C> {
    let tasks = daqgrid_task::shared(TaskManager::with_classes(classes));
    let metrics = Arc::new(SchedulerMetrics::new());
    let deploy_queue = Arc::new(DeployQueue::new());

    // One long-lived call handle, rebound by the controller on every new
    // subscription.
    let shared_calls = CallSender::detached();

    let servant = Arc::new(CommandServant::new(shared_calls.clone(), shutdown.clone()));

    let (revive_tx, revive_rx) = mpsc::channel(8);
    let environments = Arc::new(EnvironmentManager::new(
        tasks.clone(),
        servant.clone(),
        shared_calls.clone(),
        deploy_queue.clone(),
        revive_tx,
        config.transition_timeout(),
    ));

    // Tasks-deployed notifications: one slot, dropped when full.
    let (deployed_tx, mut deployed_rx) = mpsc::channel::<DeploymentMap>(1);
    let forwarder_envs = environments.clone();
    let mut forwarder_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                deployed = deployed_rx.recv() => {
                    let Some(deployed) = deployed else { break };
                    if !deployed.is_empty() {
                        forwarder_envs.register_deployed(deployed).await;
                    }
                }
                _ = forwarder_shutdown.changed() => break,
            }
        }
    });

    tokio::spawn(run_revive_loop(
        shared_calls.clone(),
        revive_rx,
        config.revive_rate(),
        shutdown.clone(),
    ));

    let matcher = OfferMatcher::new(
        tasks.clone(),
        deploy_queue,
        deployed_tx,
        MatchSettings::from_config(&config),
        metrics.clone(),
    );

    let (sched_events_tx, sched_events_rx) = mpsc::unbounded_channel();
    let controller = Controller {
        connector,
        identity,
        tasks: tasks.clone(),
        environments: environments.clone(),
        servant,
        matcher,
        shared_calls,
        config,
        metrics: metrics.clone(),
        shutdown,
        sched_events: sched_events_tx,
    };

    info!("scheduler core assembled");
    Core {
        controller,
        environments,
        tasks,
        metrics,
        sched_events: sched_events_rx,
    }
}
