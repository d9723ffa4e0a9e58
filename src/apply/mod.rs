//! The capacity search: add fake nodes cloned from a template until the
//! applications fit and the global utilization ceilings hold, and derive
//! the placement config map from the winning layout.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use log::{info, warn};

use crate::algo::adjust_nodes_order;
use crate::config::{
    load_node_file, load_plan, load_resources_from_path, AppInfo, SimonPlan, UtilizationCeilings,
};
use crate::core::cluster::{AppResource, ResourceTypes};
use crate::core::common::{
    ObjectMeta, ANNO_WORKLOAD_KIND, ANNO_WORKLOAD_NAME, CONFIG_MAP_FILE_NAME, CONFIG_MAP_NAME,
    KIND_DEPLOYMENT, KIND_STATEFUL_SET, LABEL_NEW_NODE, NAMESPACE_SYSTEM, NEW_NODE_NAME_PREFIX,
};
use crate::core::matching::{pod_matches_node_affinity, pod_tolerates_all_taints};
use crate::core::node::Node;
use crate::core::pod::Pod;
use crate::core::resources::RuntimeResources;
use crate::core::workload::{ConfigMap, DaemonSet};
use crate::error::SimonError;
use crate::simulator::expand::make_valid_node;
use crate::simulator::{simulate, ReportedPod, SimulateOptions, SimulateResult};

/// Default iteration cap of the capacity search.
pub const DEFAULT_MAX_NEW_NODES: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub use_greed: bool,
    pub interactive: bool,
}

#[derive(Debug)]
pub enum ApplyOutcome {
    /// The applications fit with this many synthetic nodes added.
    Fits {
        new_nodes: usize,
        result: SimulateResult,
    },
    /// Some pods cannot fit even an empty template node; adding more
    /// identical nodes cannot help.
    Unsatisfiable { pods: Vec<ReportedPod> },
    /// The iteration cap was reached without a fit.
    CapReached {
        cap: usize,
        last_unscheduled: Vec<ReportedPod>,
    },
}

/// A synthetic node cloned from the template: deterministic name
/// `simon-<NN>` plus the new-node marker label.
pub fn new_fake_node(template: &Node, index: usize) -> Result<Node, SimonError> {
    let mut node = template.clone();
    node.metadata.name = format!("{}-{:02}", NEW_NODE_NAME_PREFIX, index);
    node.metadata.set_label(LABEL_NEW_NODE, "");
    make_valid_node(&node)
}

fn daemon_set_contribution(template: &Node, daemon_sets: &[DaemonSet]) -> RuntimeResources {
    let mut total = RuntimeResources::default();
    for daemon_set in daemon_sets {
        let mut pod = Pod {
            metadata: daemon_set.spec.template.metadata.clone(),
            spec: daemon_set.spec.template.spec.clone(),
            status: Default::default(),
        };
        pod.metadata.name = daemon_set.metadata.name.clone();
        pod.spec.node_name = template.metadata.name.clone();
        if crate::core::matching::node_should_run_pod(template, &pod) {
            total.add(&pod.calculate_requested_resources());
        }
    }
    total
}

/// Whether the pod would fit an *empty* template node: affinity and taints
/// must match, and the requests must fit the allocatable net of the
/// daemon-set contribution.
pub fn pod_fits_empty_template(
    pod: &Pod,
    template: &Node,
    daemon_sets: &[DaemonSet],
) -> bool {
    if !pod_matches_node_affinity(pod, template) {
        return false;
    }
    if !pod_tolerates_all_taints(pod, &template.spec.taints) {
        return false;
    }
    let mut headroom = template.status.allocatable;
    headroom.sub(&daemon_set_contribution(template, daemon_sets));
    pod.calculate_requested_resources()
        .first_insufficient(&headroom)
        .is_none()
}

/// Checks the global ceilings over a successful layout: aggregate CPU and
/// memory request fractions plus aggregate VG usage.
pub fn ceilings_satisfied(result: &SimulateResult, ceilings: &UtilizationCeilings) -> bool {
    let mut requested = RuntimeResources::default();
    let mut allocatable = RuntimeResources::default();
    let mut vg_requested = 0_i64;
    let mut vg_capacity = 0_i64;
    for status in &result.node_status {
        allocatable.add(&status.node.status.allocatable);
        for pod in &status.pods {
            requested.add(&pod.calculate_requested_resources());
        }
        if let Some(storage) = status.node.local_storage() {
            for vg in &storage.vgs {
                vg_requested += vg.requested;
                vg_capacity += vg.capacity;
            }
        }
    }
    let within = |used: i64, total: i64, ceiling: i64| -> bool {
        total <= 0 || used * 100 <= total * ceiling
    };
    within(requested.cpu, allocatable.cpu, ceilings.cpu)
        && within(requested.memory, allocatable.memory, ceilings.memory)
        && within(vg_requested, vg_capacity, ceilings.vg)
}

/// Outer loop of the `apply` use-case: simulate with 0, 1, 2, … synthetic
/// nodes until the applications schedule and the ceilings hold. A fresh
/// scheduler host and store are built every iteration. `keep_going` is
/// consulted after each failed iteration (the interactive hook).
pub fn run_capacity_search(
    cluster: &ResourceTypes,
    apps: &[AppResource],
    template: &Node,
    max_new_nodes: usize,
    ceilings: &UtilizationCeilings,
    opts: &ApplyOptions,
    keep_going: &dyn Fn(usize, &[ReportedPod]) -> bool,
) -> Result<ApplyOutcome, SimonError> {
    let template = make_valid_node(template)?;
    let mut last_unscheduled = vec![];

    for count in 0..max_new_nodes {
        let mut attempt = cluster.clone();
        for index in 0..count {
            attempt.nodes.push(new_fake_node(&template, index)?);
        }

        let sim_opts = SimulateOptions {
            use_greed: opts.use_greed,
            ..Default::default()
        };
        let result = simulate(&attempt, apps, &sim_opts)?;

        if result.unscheduled_pods.is_empty() {
            if ceilings_satisfied(&result, ceilings) {
                info!("a successful scheduling with {} new node(s)", count);
                return Ok(ApplyOutcome::Fits {
                    new_nodes: count,
                    result,
                });
            }
            info!(
                "{} new node(s) schedule everything but exceed the utilization ceilings",
                count
            );
            last_unscheduled = vec![];
            continue;
        }

        let mut all_daemon_sets = cluster.daemon_sets.clone();
        for app in apps {
            all_daemon_sets.extend(app.resource.daemon_sets.clone());
        }
        let hopeless: Vec<ReportedPod> = result
            .unscheduled_pods
            .iter()
            .filter(|entry| !pod_fits_empty_template(&entry.pod, &template, &all_daemon_sets))
            .cloned()
            .collect();
        if !hopeless.is_empty() {
            warn!(
                "{} pod(s) cannot fit the template node; adding more identical nodes cannot help",
                hopeless.len()
            );
            return Ok(ApplyOutcome::Unsatisfiable { pods: hopeless });
        }

        info!(
            "{} new node(s): {} pod(s) still unscheduled",
            count,
            result.unscheduled_pods.len()
        );
        if !keep_going(count, &result.unscheduled_pods) {
            return Ok(ApplyOutcome::CapReached {
                cap: count,
                last_unscheduled: result.unscheduled_pods,
            });
        }
        last_unscheduled = result.unscheduled_pods;
    }

    Ok(ApplyOutcome::CapReached {
        cap: max_new_nodes,
        last_unscheduled,
    })
}

/// The placement config map: `data` keys `Deployment` and `StatefulSet`,
/// each a JSON map `"<namespace>/<workload>" → [node, …]` with real nodes
/// first, synthetic nodes last, lexicographic within each partition.
pub fn build_placement_config_map(result: &SimulateResult) -> Result<ConfigMap, SimonError> {
    let mut deployments: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut stateful_sets: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for status in &result.node_status {
        for pod in &status.pods {
            let kind = pod.metadata.annotations.get(ANNO_WORKLOAD_KIND);
            let name = pod.metadata.annotations.get(ANNO_WORKLOAD_NAME);
            let (kind, name) = match (kind, name) {
                (Some(kind), Some(name)) => (kind.as_str(), name),
                _ => continue,
            };
            let key = format!("{}/{}", pod.metadata.namespace, name);
            let target = match kind {
                KIND_DEPLOYMENT => &mut deployments,
                KIND_STATEFUL_SET => &mut stateful_sets,
                _ => continue,
            };
            target
                .entry(key)
                .or_default()
                .push(status.node.metadata.name.clone());
        }
    }
    for nodes in deployments.values_mut().chain(stateful_sets.values_mut()) {
        adjust_nodes_order(nodes);
    }

    let mut config_map = ConfigMap {
        metadata: ObjectMeta::named(CONFIG_MAP_NAME, NAMESPACE_SYSTEM),
        data: BTreeMap::new(),
    };
    config_map.data.insert(
        KIND_DEPLOYMENT.to_string(),
        serde_json::to_string(&deployments)?,
    );
    config_map.data.insert(
        KIND_STATEFUL_SET.to_string(),
        serde_json::to_string(&stateful_sets)?,
    );
    Ok(config_map)
}

pub fn write_config_map_file(config_map: &ConfigMap, path: &Path) -> Result<(), SimonError> {
    let file = std::fs::File::create(path)?;
    serde_yaml::to_writer(file, config_map)?;
    Ok(())
}

/// File-driven front of the capacity search, built from a plan file.
pub struct Applier {
    plan: SimonPlan,
    opts: ApplyOptions,
}

fn confirm(prompt: &str) -> bool {
    print!("{} (y/n): ", prompt);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

impl Applier {
    pub fn from_plan_file(path: &Path, opts: ApplyOptions) -> Result<Self, SimonError> {
        Ok(Applier {
            plan: load_plan(path)?,
            opts,
        })
    }

    pub fn new(plan: SimonPlan, opts: ApplyOptions) -> Self {
        Applier { plan, opts }
    }

    fn load_app(&self, app: &AppInfo) -> Result<AppResource, SimonError> {
        if app.chart {
            return Err(SimonError::InvalidInput(format!(
                "app {:?}: chart templating is delegated to a collaborator, \
                 render the chart to plain manifests first",
                app.name
            )));
        }
        Ok(AppResource {
            name: app.name.clone(),
            resource: load_resources_from_path(Path::new(&app.path))?,
        })
    }

    pub fn run(&self) -> Result<ApplyOutcome, SimonError> {
        if !self.plan.spec.cluster.kube_config.is_empty() {
            return Err(SimonError::Environmental(
                "snapshotting a live cluster (cluster.kubeConfig) requires a collaborator; \
                 use cluster.customConfig with an exported snapshot directory"
                    .to_string(),
            ));
        }
        let cluster =
            load_resources_from_path(Path::new(&self.plan.spec.cluster.custom_config))?;
        let mut apps = vec![];
        for app in &self.plan.spec.app_list {
            apps.push(self.load_app(app)?);
        }
        let template = load_node_file(Path::new(&self.plan.spec.new_node))?;
        let ceilings = UtilizationCeilings::from_env();
        let cap = self
            .plan
            .spec
            .max_new_nodes
            .unwrap_or(DEFAULT_MAX_NEW_NODES);

        let interactive = self.opts.interactive;
        let keep_going = move |count: usize, _failed: &[ReportedPod]| -> bool {
            if !interactive {
                return true;
            }
            confirm(&format!(
                "{} new node(s) were not enough, keep adding",
                count
            ))
        };

        let outcome = run_capacity_search(
            &cluster,
            &apps,
            &template,
            cap,
            &ceilings,
            &self.opts,
            &keep_going,
        )?;

        if let ApplyOutcome::Fits { result, .. } = &outcome {
            let config_map = build_placement_config_map(result)?;
            write_config_map_file(&config_map, Path::new(CONFIG_MAP_FILE_NAME))?;
            info!("wrote placement config map to {}", CONFIG_MAP_FILE_NAME);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::{NodeStorage, VirtualGroup};
    use crate::simulator::NodeStatus;

    fn template_node(cpu: i64, memory: i64) -> Node {
        let mut node = Node::default();
        node.metadata.name = "template".to_string();
        node.status.capacity.cpu = cpu;
        node.status.capacity.memory = memory;
        node.status.allocatable = node.status.capacity;
        node
    }

    #[test]
    fn test_new_fake_node_naming() {
        let node = new_fake_node(&template_node(8000, 16 << 30), 3).unwrap();
        assert_eq!("simon-03", node.metadata.name);
        assert!(node.metadata.has_label(LABEL_NEW_NODE));
    }

    #[test]
    fn test_pod_fits_empty_template_checks_headroom() {
        let template = template_node(2000, 4 << 30);
        let mut pod = Pod::default();
        pod.metadata.name = "big".to_string();
        pod.spec.containers.push(crate::core::pod::Container {
            resources: crate::core::pod::ResourceRequirements {
                requests: RuntimeResources {
                    cpu: 3000,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(!pod_fits_empty_template(&pod, &template, &[]));
        pod.spec.containers[0].resources.requests.cpu = 1000;
        assert!(pod_fits_empty_template(&pod, &template, &[]));
    }

    #[test]
    fn test_ceilings_use_vg_aggregate() {
        let mut node = template_node(8000, 16 << 30);
        node.set_local_storage(&NodeStorage {
            vgs: vec![VirtualGroup {
                name: "pool0".to_string(),
                capacity: 100,
                requested: 90,
            }],
            devices: vec![],
        });
        let result = SimulateResult {
            unscheduled_pods: vec![],
            node_status: vec![NodeStatus {
                node,
                pods: vec![],
            }],
        };
        let mut ceilings = UtilizationCeilings::default();
        assert!(ceilings_satisfied(&result, &ceilings));
        ceilings.vg = 80;
        assert!(!ceilings_satisfied(&result, &ceilings));
    }
}
