//! daqd — the daqgrid control-plane daemon.
//!
//! Runs the scheduler core against a resource manager. The wire
//! transport to a production manager is deployment-specific; in-tree the
//! daemon offers the loopback cluster, a simulated set of agents that is
//! enough to exercise workflow deployment and environment transitions
//! end to end.
//!
//! # Usage
//!
//! ```text
//! daqd run --data-dir /var/lib/daqgrid --classes classes.toml
//! daqd run --classes classes.toml --workflow chain --workflow-dir ./workflows
//! daqd check-config --config core.toml
//! ```

mod workflows;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use daq_core::{Attribute, Attributes, CoreConfig, PortRange, ResourceBundle, TaskLifecycle};
use daqgrid_env::EnvironmentAction;
use daqgrid_scheduler::{assemble, Core};
use daqgrid_state::IdentityStore;
use daqgrid_transport::{AgentSpec, LoopbackCluster};

use workflows::TomlWorkflowSource;

#[derive(Parser)]
#[command(name = "daqd", about = "daqgrid control-plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler core against the loopback cluster.
    Run {
        /// Core configuration file (TOML); defaults apply when absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the identity store.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Task class catalog (TOML).
        #[arg(long)]
        classes: Option<PathBuf>,

        /// Workflow to deploy and start after connecting.
        #[arg(long)]
        workflow: Option<String>,

        /// Directory holding workflow TOML files.
        #[arg(long, default_value = "./workflows")]
        workflow_dir: PathBuf,

        /// Number of simulated agents.
        #[arg(long, default_value = "2")]
        agents: u32,

        /// Attribute role advertised by the simulated agents.
        #[arg(long, default_value = "FLP")]
        agent_role: String,

        /// Log every incoming event.
        #[arg(long)]
        verbose: bool,
    },

    /// Parse and print the effective configuration, then exit.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,daqd=debug,daqgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            classes,
            workflow,
            workflow_dir,
            agents,
            agent_role,
            verbose,
        } => {
            let mut config = load_config(config)?;
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if verbose {
                config.verbose = true;
            }
            run(config, classes, workflow, workflow_dir, agents, agent_role).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<CoreConfig> {
    match path {
        Some(path) => Ok(CoreConfig::from_file(&path)?),
        None => Ok(CoreConfig::default()),
    }
}

async fn run(
    config: CoreConfig,
    classes: Option<PathBuf>,
    workflow: Option<String>,
    workflow_dir: PathBuf,
    agents: u32,
    agent_role: String,
) -> anyhow::Result<()> {
    info!("daqgrid daemon starting in loopback mode");

    // ── Identity store ─────────────────────────────────────────────
    std::fs::create_dir_all(&config.data_dir)?;
    let identity_path = config.data_dir.join("identity.redb");
    let identity = IdentityStore::open(&identity_path)?;
    info!(path = ?identity_path, "identity store opened");

    // ── Task class catalog ─────────────────────────────────────────
    let classes = match classes {
        Some(path) => {
            let classes = workflows::load_classes(&path)?;
            info!(path = ?path, classes = classes.len(), "task classes loaded");
            classes
        }
        None => {
            warn!("no class catalog given, only classless workflows will deploy");
            Vec::new()
        }
    };

    // ── Simulated cluster ──────────────────────────────────────────
    let cluster = LoopbackCluster::new(
        (1..=agents)
            .map(|n| AgentSpec {
                hostname: format!("{}-{n}", agent_role.to_lowercase()),
                attributes: Attributes(vec![Attribute::new("role", &agent_role)]),
                resources: ResourceBundle::new(
                    8.0,
                    16384.0,
                    vec![PortRange::new(10000, 11000), PortRange::new(47101, 47200)],
                ),
            })
            .collect(),
    );
    info!(agents, role = %agent_role, "loopback cluster ready");

    // ── Core ───────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let Core {
        controller,
        environments,
        tasks,
        metrics: _,
        mut sched_events,
    } = assemble(
        config.clone(),
        classes,
        identity,
        cluster.connector(),
        shutdown_rx,
    );

    let mut controller_handle = tokio::spawn(controller.run());

    // Surface connectivity on the scheduler events channel.
    let events_handle = tokio::spawn(async move {
        while let Some(event) = sched_events.recv().await {
            info!(?event, "scheduler event");
        }
    });

    // ── Optional demo workflow ─────────────────────────────────────
    if let Some(workflow_name) = workflow {
        let source = TomlWorkflowSource::new(&workflow_dir);
        match environments.create_from_source(&source, &workflow_name).await {
            Err(e) => error!(workflow = %workflow_name, error = %e, "cannot create environment"),
            Ok(env_id) => {
                info!(environment_id = %env_id, workflow = %workflow_name, "deploying");
                if let Err(e) = environments.deploy(&env_id).await {
                    error!(error = %e, "deploy failed");
                } else {
                    drive_to_running(&environments, &tasks, &env_id).await;
                }
            }
        }
    }

    // ── Shutdown on ctrl-c or controller death ─────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            match controller_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "controller ended with a fatal error"),
                Err(e) => error!(error = %e, "controller task panicked"),
            }
        }
        result = &mut controller_handle => {
            match result {
                Ok(Ok(())) => info!("controller exited"),
                Ok(Err(e)) => error!(error = %e, "controller ended with a fatal error"),
                Err(e) => error!(error = %e, "controller task panicked"),
            }
            let _ = shutdown_tx.send(true);
        }
    }
    events_handle.abort();

    info!("daqgrid daemon stopped");
    Ok(())
}

/// Wait for the environment's tasks, then configure and start it.
async fn drive_to_running(
    environments: &daqgrid_env::EnvironmentManager,
    tasks: &daqgrid_task::SharedTaskManager,
    env_id: &str,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    loop {
        let attached = environments.task_ids(env_id).await.len();
        let running = {
            let tasks = tasks.lock().expect("state lock poisoned");
            tasks
                .tasks_for_environment(env_id)
                .iter()
                .filter(|t| t.lifecycle == TaskLifecycle::Running)
                .count()
        };
        if attached > 0 && attached == running {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            error!(environment_id = %env_id, "workflow tasks never came up");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for action in [EnvironmentAction::Configure, EnvironmentAction::Start] {
        match environments.transition(env_id, action).await {
            Ok(state) => info!(environment_id = %env_id, state = %state, "transition done"),
            Err(e) => {
                error!(environment_id = %env_id, error = %e, "transition failed");
                return;
            }
        }
    }
    info!(environment_id = %env_id, "environment running");
}
