//! Offer matcher — per-cycle allocation of descriptors to offers.
//!
//! Runs inside the OFFERS event handler. Descriptors are walked in
//! reverse insertion order, a deliberate LIFO bias: the newest workloads
//! compete first, and in-place removal stays safe. Offers are visited in
//! arrival order; there is no bin-packing across offers within a cycle.
//!
//! The state mutex is held across the whole per-offer inner loop so port
//! allocation and task construction are atomic with respect to status
//! updates; the ACCEPT for an offer is issued only after the mutex is
//! released.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use daq_core::{CoreConfig, Descriptor, Offer, OfferId, PortRange, ResourceBundle, TaskId};
use daqgrid_task::{DeployQueue, SharedTaskManager};
use daqgrid_transport::{CallSender, LaunchInfo};

use crate::metrics::SchedulerMetrics;

/// Tasks launched in one cycle, keyed by task id.
pub type DeploymentMap = HashMap<TaskId, Descriptor>;

/// Matching knobs extracted from the core configuration.
#[derive(Debug, Clone)]
pub struct MatchSettings {
    /// Control ports are allocated strictly above this floor.
    pub control_port_floor: u16,
    /// Dynamic data ports are allocated strictly above this floor.
    pub dynamic_port_floor: u16,
    pub very_verbose: bool,
    pub summary_metrics: bool,
    pub resource_type_metrics: bool,
}

impl MatchSettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            control_port_floor: config.control_port_floor,
            dynamic_port_floor: config.dynamic_port_floor,
            very_verbose: config.very_verbose,
            summary_metrics: config.summary_metrics,
            resource_type_metrics: config.resource_type_metrics,
        }
    }
}

/// Consumes offers and pending descriptors, produces launches.
pub struct OfferMatcher {
    tasks: SharedTaskManager,
    deploy_queue: Arc<DeployQueue>,
    /// Descriptors no cycle could place yet; retried every cycle.
    backlog: Vec<Descriptor>,
    /// One-slot tasks-deployed notification; dropped when full or when
    /// nobody listens.
    deployed_tx: mpsc::Sender<DeploymentMap>,
    settings: MatchSettings,
    metrics: Arc<SchedulerMetrics>,
}

impl OfferMatcher {
    pub fn new(
        tasks: SharedTaskManager,
        deploy_queue: Arc<DeployQueue>,
        deployed_tx: mpsc::Sender<DeploymentMap>,
        settings: MatchSettings,
        metrics: Arc<SchedulerMetrics>,
    ) -> Self {
        Self {
            tasks,
            deploy_queue,
            backlog: Vec::new(),
            deployed_tx,
            settings,
            metrics,
        }
    }

    /// Descriptors still waiting for a matching offer.
    pub fn pending_count(&self) -> usize {
        self.backlog.len()
    }

    /// Run one matching cycle over the received offers.
    pub async fn handle_offers(&mut self, offers: Vec<Offer>, calls: &CallSender) {
        self.metrics.add_offers(offers.len() as u64);

        let mut descriptors = std::mem::take(&mut self.backlog);
        descriptors.extend(self.deploy_queue.take());

        if self.settings.very_verbose {
            if descriptors.is_empty() {
                debug!("no roles need deployment");
            } else {
                let classes: Vec<&str> =
                    descriptors.iter().map(|d| d.class_name.as_str()).collect();
                debug!(offers = offers.len(), classes = %classes.join(","),
                    "received descriptors for this offers round");
            }
        }

        // By default we get ready to decline every offer.
        let mut decline_set: HashSet<OfferId> = offers.iter().map(|o| o.id.clone()).collect();
        let mut deployed = DeploymentMap::new();
        let mut launched_this_cycle = 0usize;

        if !descriptors.is_empty() {
            for offer in &offers {
                let executor_id = offer
                    .executor_ids
                    .first()
                    .cloned()
                    .unwrap_or_else(|| format!("x-{}", Uuid::new_v4()));

                let mut launches: Vec<LaunchInfo> = Vec::new();
                let mut deployed_for_offer = DeploymentMap::new();

                {
                    let mut tasks = self.tasks.lock().expect("state lock poisoned");
                    let mut constraints = tasks.build_descriptor_constraints(&descriptors);
                    let mut remaining = offer.resources.clone();

                    debug!(offer_id = %offer.id, hostname = %offer.hostname, "processing offer");

                    // Avoid the expense of totalling these unless asked.
                    if self.settings.summary_metrics && self.settings.resource_type_metrics {
                        debug!(offer_id = %offer.id,
                            cpus = remaining.cpus,
                            memory_mib = remaining.memory_mib,
                            ports = remaining.total_ports(),
                            "offered resources by type");
                    }

                    // Walk descriptors in reverse, removing as we match.
                    let mut i = descriptors.len();
                    'descriptors: while i > 0 {
                        i -= 1;
                        let descriptor = &descriptors[i];

                        if !offer.attributes.satisfy(&constraints[i]) {
                            if self.settings.very_verbose {
                                debug!(class = %descriptor.class_name,
                                    constraints = %constraints[i],
                                    attributes = %offer.attributes,
                                    "constraints not satisfied by offer attributes");
                            }
                            continue;
                        }

                        let Some(wants) = tasks.wants_for_descriptor(descriptor).cloned() else {
                            warn!(class = %descriptor.class_name,
                                "no resource demands for descriptor, unknown class?");
                            continue;
                        };
                        if !remaining.satisfies(&wants) {
                            debug!(class = %descriptor.class_name, "offer cannot cover demand");
                            continue;
                        }

                        // Allocate on a scratch bundle so an abandoned
                        // descriptor leaves the offer untouched.
                        let mut scratch = remaining.clone();
                        scratch.subtract_scalars(wants.cpus, wants.memory_mib);
                        for range in &wants.static_ports {
                            if !scratch.claim_range(*range) {
                                debug!(offer_id = %offer.id, "static port span gone, next offer");
                                break 'descriptors;
                            }
                        }

                        let mut bind_ports = BTreeMap::new();
                        for bind in &wants.bind_ports {
                            let Some(port) =
                                scratch.min_port_above(self.settings.dynamic_port_floor)
                            else {
                                debug!(offer_id = %offer.id, "out of dynamic ports, next offer");
                                break 'descriptors;
                            };
                            scratch.claim_port(port);
                            bind_ports.insert(bind.name.clone(), port);
                        }

                        let Some(control_port) =
                            scratch.min_port_above(self.settings.control_port_floor)
                        else {
                            debug!(offer_id = %offer.id, "out of control ports, next offer");
                            break 'descriptors;
                        };
                        scratch.claim_port(control_port);

                        tasks.agent_cache.update(
                            &offer.agent_id,
                            &offer.hostname,
                            offer.attributes.clone(),
                        );

                        let Some(task) = tasks.new_task_for_offer(
                            offer,
                            descriptor,
                            bind_ports.clone(),
                            control_port,
                            &executor_id,
                        ) else {
                            error!(offer_id = %offer.id, class = %descriptor.class_name,
                                "cannot create task for offer and descriptor, this should never happen");
                            continue;
                        };

                        let data = match tasks
                            .build_task_command(&task)
                            .map_err(|e| e.to_string())
                            .and_then(|cmd| {
                                serde_json::to_vec(&cmd).map_err(|e| e.to_string())
                            }) {
                            Ok(data) => data,
                            Err(e) => {
                                error!(task_id = %task.id, error = %e,
                                    "cannot serialize task command for executor");
                                tasks.remove_task(&task.id);
                                continue;
                            }
                        };

                        // Point of no return for this descriptor.
                        remaining = scratch;

                        let mut ports: Vec<PortRange> = wants.static_ports.clone();
                        ports.extend(bind_ports.values().map(|&p| PortRange::new(p, p)));
                        ports.push(PortRange::new(control_port, control_port));

                        debug!(task_id = %task.id, offer_id = %offer.id,
                            control_port, "launching task");

                        launches.push(LaunchInfo {
                            task_id: task.id.clone(),
                            name: task.name(),
                            agent_id: offer.agent_id.clone(),
                            executor_id: executor_id.clone(),
                            resources: ResourceBundle::new(wants.cpus, wants.memory_mib, ports),
                            data,
                        });
                        deployed_for_offer.insert(task.id.clone(), descriptors.remove(i));
                        constraints.remove(i);
                    }
                } // state mutex released before any call goes out

                if launches.is_empty() {
                    continue;
                }
                decline_set.remove(&offer.id);

                let count = launches.len();
                match calls.accept(offer.id.clone(), launches).await {
                    Ok(()) => {
                        launched_this_cycle += count;
                        info!(offer_id = %offer.id, tasks = count, "tasks launched");
                        deployed.extend(deployed_for_offer);
                    }
                    Err(e) => {
                        // Logged, not acted on; a lost launch surfaces
                        // later as a task status update.
                        error!(offer_id = %offer.id, error = %e, "failed to launch tasks");
                    }
                }
            }
        }

        let decline: Vec<OfferId> = decline_set.into_iter().collect();
        if decline.is_empty() {
            debug!("no offers to decline");
        } else {
            let count = decline.len();
            match calls.decline(decline).await {
                Ok(()) => {
                    self.metrics.add_declined(count as u64);
                    debug!(offers = count, "offers declined");
                }
                Err(e) => error!(error = %e, "failed to decline offers"),
            }
        }

        // Unmatched descriptors stay pending for the next cycle.
        self.backlog = descriptors;
        self.metrics.set_pending(self.backlog.len() as u64);

        // Notify listeners; their absence is not an error.
        if !deployed.is_empty() {
            match self.deployed_tx.try_send(deployed) {
                Ok(()) => debug!("listeners notified on offers cycle done"),
                Err(_) => {
                    if self.settings.very_verbose {
                        debug!("no listeners notified");
                    }
                }
            }
        }

        self.metrics.add_launched(launched_this_cycle as u64);
        if self.settings.summary_metrics {
            self.metrics.log_summary();
        }
        debug!(tasks = launched_this_cycle, "offers cycle complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::{
        Attribute, Attributes, BindPort, CommandRecipe, Constraint, Constraints, ResourceDemand,
        TaskClass,
    };
    use daqgrid_task::TaskManager;
    use daqgrid_transport::{pair, Call};

    fn make_class(name: &str, binds: &[&str], constraints: Constraints) -> TaskClass {
        TaskClass {
            name: name.to_string(),
            wants: ResourceDemand {
                cpus: 2.0,
                memory_mib: 1024.0,
                static_ports: vec![],
                bind_ports: binds.iter().map(|b| BindPort::new(b)).collect(),
            },
            constraints,
            command: CommandRecipe {
                value: format!("/opt/daq/{name}"),
                arguments: vec![],
                env: vec![],
                shell: false,
            },
        }
    }

    fn make_offer(n: u32, role: &str, ports: &[(u16, u16)]) -> Offer {
        Offer {
            id: format!("offer-{n}"),
            agent_id: format!("agent-{n}"),
            hostname: format!("host-{n}"),
            attributes: Attributes(vec![Attribute::new("role", role)]),
            resources: ResourceBundle::new(
                4.0,
                8192.0,
                ports.iter().map(|&(b, e)| PortRange::new(b, e)).collect(),
            ),
            executor_ids: vec![],
        }
    }

    fn make_descriptor(class: &str, role_constraints: Constraints) -> Descriptor {
        Descriptor {
            class_name: class.to_string(),
            role_path: format!("daq/{class}"),
            environment_id: "env-1".to_string(),
            role_constraints,
        }
    }

    struct Fixture {
        matcher: OfferMatcher,
        tasks: SharedTaskManager,
        deployed_rx: mpsc::Receiver<DeploymentMap>,
    }

    fn fixture(classes: Vec<TaskClass>) -> Fixture {
        let tasks = daqgrid_task::shared(TaskManager::with_classes(classes));
        let (deployed_tx, deployed_rx) = mpsc::channel(1);
        let queue = Arc::new(DeployQueue::new());
        let matcher = OfferMatcher::new(
            tasks.clone(),
            queue,
            deployed_tx,
            MatchSettings {
                control_port_floor: 47100,
                dynamic_port_floor: 8999,
                very_verbose: true,
                summary_metrics: false,
                resource_type_metrics: false,
            },
            Arc::new(SchedulerMetrics::new()),
        );
        Fixture { matcher, tasks, deployed_rx }
    }

    fn queue_descriptors(fixture: &Fixture, descriptors: Vec<Descriptor>) {
        fixture.matcher.deploy_queue.push(descriptors);
    }

    async fn drain_calls(remote: &mut daqgrid_transport::RemoteEnd) -> Vec<Call> {
        let mut calls = Vec::new();
        while let Ok(call) = remote.calls.try_recv() {
            calls.push(call);
        }
        calls
    }

    #[tokio::test]
    async fn single_offer_happy_path() {
        let mut f = fixture(vec![make_class("readout", &["data"], Constraints::default())]);
        let (conn, mut remote) = pair(16);
        queue_descriptors(&f, vec![make_descriptor("readout", Constraints::default())]);

        let offer = make_offer(1, "FLP", &[(10000, 11000), (47101, 47200)]);
        f.matcher.handle_offers(vec![offer], &conn.calls).await;

        let calls = drain_calls(&mut remote).await;
        assert_eq!(calls.len(), 1, "expected a single ACCEPT and no DECLINE");
        match &calls[0] {
            Call::Accept { offer_id, launches } => {
                assert_eq!(offer_id, "offer-1");
                assert_eq!(launches.len(), 1);
                let launch = &launches[0];
                let tasks = f.tasks.lock().unwrap();
                let task = tasks.get_task(&launch.task_id).unwrap();
                assert_eq!(task.bind_ports.get("data"), Some(&10000));
                assert_eq!(task.control_port, 47101);
            }
            other => panic!("expected ACCEPT, got {other:?}"),
        }
        assert_eq!(f.matcher.pending_count(), 0);

        let deployed = f.deployed_rx.try_recv().unwrap();
        assert_eq!(deployed.len(), 1);
    }

    #[tokio::test]
    async fn constraint_mismatch_declines_other_offer() {
        let mut f = fixture(vec![make_class(
            "readout",
            &[],
            Constraints(vec![Constraint::equals("role", "FLP")]),
        )]);
        let (conn, mut remote) = pair(16);
        queue_descriptors(&f, vec![make_descriptor("readout", Constraints::default())]);

        let offers = vec![
            make_offer(1, "FLP", &[(47101, 47200)]),
            make_offer(2, "EPN", &[(47101, 47200)]),
        ];
        f.matcher.handle_offers(offers, &conn.calls).await;

        let calls = drain_calls(&mut remote).await;
        let accepts: Vec<_> = calls
            .iter()
            .filter(|c| matches!(c, Call::Accept { .. }))
            .collect();
        assert_eq!(accepts.len(), 1);
        match accepts[0] {
            Call::Accept { offer_id, .. } => assert_eq!(offer_id, "offer-1"),
            _ => unreachable!(),
        }
        let declined: Vec<&OfferId> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Decline { offer_ids } => Some(offer_ids.iter()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(declined, vec!["offer-2"]);
    }

    #[tokio::test]
    async fn port_exhaustion_keeps_descriptor_pending() {
        let mut f = fixture(vec![make_class(
            "readout",
            &["data", "monitor"],
            Constraints::default(),
        )]);
        let (conn, mut remote) = pair(16);
        queue_descriptors(&f, vec![make_descriptor("readout", Constraints::default())]);

        // One port available, two dynamic ports demanded.
        let offer = make_offer(1, "FLP", &[(10000, 10000)]);
        f.matcher.handle_offers(vec![offer], &conn.calls).await;

        let calls = drain_calls(&mut remote).await;
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Decline { offer_ids } if offer_ids == &vec!["offer-1".to_string()]));
        assert_eq!(f.matcher.pending_count(), 1, "descriptor must stay pending");
        assert_eq!(f.tasks.lock().unwrap().task_count(), 0);
    }

    #[tokio::test]
    async fn reverse_order_matches_newest_first() {
        let mut f = fixture(vec![
            make_class("old", &[], Constraints::default()),
            make_class("new", &[], Constraints::default()),
        ]);
        let (conn, mut remote) = pair(16);
        queue_descriptors(
            &f,
            vec![
                make_descriptor("old", Constraints::default()),
                make_descriptor("new", Constraints::default()),
            ],
        );

        // Room for exactly one task (2.0 cpus demanded each).
        let mut offer = make_offer(1, "FLP", &[(47101, 47200)]);
        offer.resources.cpus = 2.0;
        f.matcher.handle_offers(vec![offer], &conn.calls).await;

        let calls = drain_calls(&mut remote).await;
        let launched: Vec<String> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Accept { launches, .. } => {
                    Some(launches.iter().map(|l| l.name.clone()))
                }
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(launched, vec!["daq/new:new"], "last-submitted matches first");
        assert_eq!(f.matcher.pending_count(), 1);
    }

    #[tokio::test]
    async fn offer_conservation_across_launches() {
        let mut f = fixture(vec![make_class("readout", &["data"], Constraints::default())]);
        let (conn, mut remote) = pair(16);
        queue_descriptors(
            &f,
            vec![
                make_descriptor("readout", Constraints::default()),
                make_descriptor("readout", Constraints::default()),
            ],
        );

        let offer = make_offer(1, "FLP", &[(10000, 10001), (47101, 47102)]);
        f.matcher.handle_offers(vec![offer], &conn.calls).await;

        let calls = drain_calls(&mut remote).await;
        let launches: Vec<&LaunchInfo> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Accept { launches, .. } => Some(launches.iter()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(launches.len(), 2);

        let total_cpus: f64 = launches.iter().map(|l| l.resources.cpus).sum();
        assert!(total_cpus <= 4.0);

        // Bound ports must be disjoint across the two tasks.
        let mut ports: Vec<u16> = launches
            .iter()
            .flat_map(|l| l.resources.ports.iter())
            .flat_map(|r| r.begin..=r.end)
            .collect();
        let count = ports.len();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), count, "a port was allocated twice");
    }

    #[tokio::test]
    async fn unknown_class_descriptor_is_skipped() {
        let mut f = fixture(vec![]);
        let (conn, mut remote) = pair(16);
        queue_descriptors(&f, vec![make_descriptor("ghost", Constraints::default())]);

        let offer = make_offer(1, "FLP", &[(47101, 47200)]);
        f.matcher.handle_offers(vec![offer], &conn.calls).await;

        let calls = drain_calls(&mut remote).await;
        assert!(matches!(&calls[0], Call::Decline { .. }));
    }

    #[tokio::test]
    async fn empty_cycle_declines_everything() {
        let mut f = fixture(vec![]);
        let (conn, mut remote) = pair(16);

        let offers = vec![
            make_offer(1, "FLP", &[(47101, 47200)]),
            make_offer(2, "EPN", &[(47101, 47200)]),
        ];
        f.matcher.handle_offers(offers, &conn.calls).await;

        let calls = drain_calls(&mut remote).await;
        assert_eq!(calls.len(), 1);
        match &calls[0] {
            Call::Decline { offer_ids } => assert_eq!(offer_ids.len(), 2),
            other => panic!("expected DECLINE, got {other:?}"),
        }
    }
}
