//! The simulation driver: seeds a fresh scheduler host with a cluster
//! snapshot, dispatches the existing pods, then deploys each application in
//! order and collects the outcome.

pub mod expand;

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;

use crate::algo::{sort_pods_affinity_first, sort_pods_greedy, sort_pods_toleration_first};
use crate::core::cluster::{AppResource, ResourceTypes};
use crate::core::common::LABEL_APP_NAME;
use crate::core::node::Node;
use crate::core::pod::Pod;
use crate::core::workload::ConfigMap;
use crate::error::SimonError;
use crate::scheduler::host::SchedulerHost;
pub use crate::scheduler::host::UnscheduledPod;
use crate::scheduler::plugins::{default_profile, PluginFactory, Profile};
use crate::simulator::expand::{expand_workloads, make_valid_node, NameSalt};
use crate::store::FakeCluster;

/// The per-node slice of a simulation result: the node's final state plus
/// every pod bound to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node: Node,
    pub pods: Vec<Pod>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulateResult {
    pub unscheduled_pods: Vec<ReportedPod>,
    pub node_status: Vec<NodeStatus>,
}

/// Serializable form of an unscheduled pod.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportedPod {
    pub pod: Pod,
    pub reason: String,
}

impl From<UnscheduledPod> for ReportedPod {
    fn from(value: UnscheduledPod) -> Self {
        ReportedPod {
            pod: value.pod,
            reason: value.reason,
        }
    }
}

pub type PatchPodHook = Box<dyn Fn(&mut Pod)>;

pub struct SimulateOptions {
    /// Present only for API-shape compatibility; a live snapshot needs a
    /// collaborator this crate does not embed.
    pub kubeconfig_path: Option<PathBuf>,
    pub profile: Option<Profile>,
    pub extra_plugins: HashMap<String, PluginFactory>,
    pub extra_config_maps: Vec<ConfigMap>,
    pub patch_pod_hooks: Vec<PatchPodHook>,
    /// Greedy dominant-share ordering applied before the constraint sorts.
    pub use_greed: bool,
    /// Seed of the short name hashes; fixed seeds make reruns reproducible.
    pub name_seed: u64,
    pub write_to_file: Option<PathBuf>,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        SimulateOptions {
            kubeconfig_path: None,
            profile: None,
            extra_plugins: HashMap::new(),
            extra_config_maps: vec![],
            patch_pod_hooks: vec![],
            use_greed: false,
            name_seed: 0,
            write_to_file: None,
        }
    }
}

/// Simulates deploying `apps` (in order) onto `cluster`.
///
/// Every input pod, after workload and daemon-set expansion, ends up in
/// exactly one of `node_status[*].pods` or `unscheduled_pods`.
pub fn simulate(
    cluster: &ResourceTypes,
    apps: &[AppResource],
    opts: &SimulateOptions,
) -> Result<SimulateResult, SimonError> {
    if opts.kubeconfig_path.is_some() {
        return Err(SimonError::Environmental(
            "snapshotting a live cluster is delegated to a collaborator; \
             provide the cluster as a ResourceTypes value"
                .to_string(),
        ));
    }

    let mut salt = NameSalt::from_seed(opts.name_seed);

    // normalized cluster nodes, keeping the snapshot's input order for the
    // daemon-set expansion
    let mut cluster_nodes = vec![];
    for node in &cluster.nodes {
        cluster_nodes.push(make_valid_node(node)?);
    }

    // standalone pods are normalized and every workload template (daemon
    // sets included) is materialized over the snapshot's node order
    let cluster_pods = expand_workloads(cluster, &cluster_nodes, &mut salt)?;

    let store = Arc::new(FakeCluster::new());
    let mut host = SchedulerHost::new(
        store.clone(),
        opts.profile.as_ref().unwrap_or(&default_profile()),
        &opts.extra_plugins,
    )?;

    for node in &cluster_nodes {
        store
            .create_node(node.clone())
            .map_err(|err| SimonError::SeedConflict(format!("unable to copy node: {}", err)))?;
    }
    store.seed_cluster_objects(cluster)?;
    for config_map in &opts.extra_config_maps {
        store.create_config_map(config_map.clone())?;
    }

    info!("sync {} pod(s) to fake cluster", cluster_pods.len());
    let mut unscheduled = host.schedule_pods(order_pods(cluster_pods, &store, false))?;

    for app in apps {
        let mut pods = expand_workloads(&app.resource, &store.list_nodes(), &mut salt)?;
        for pod in pods.iter_mut() {
            pod.metadata.set_label(LABEL_APP_NAME, &app.name);
            for hook in &opts.patch_pod_hooks {
                hook(pod);
            }
        }
        let pods = order_pods(pods, &store, opts.use_greed);
        debug!("app {:?}: {} pods to be simulated", app.name, pods.len());
        unscheduled.extend(host.schedule_pods(pods)?);
    }

    let node_status = snapshot_node_status(&store);
    host.close();

    let result = SimulateResult {
        unscheduled_pods: unscheduled.into_iter().map(ReportedPod::from).collect(),
        node_status,
    };

    if let Some(path) = &opts.write_to_file {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &result)?;
    }

    Ok(result)
}

/// Pods already carrying a node name (daemon-set instances, static pods)
/// go first so their occupancy is visible to every scheduling decision;
/// the queue policies order the rest.
fn order_pods(pods: Vec<Pod>, store: &FakeCluster, use_greed: bool) -> Vec<Pod> {
    let (mut ordered, mut unbound): (Vec<Pod>, Vec<Pod>) = pods
        .into_iter()
        .partition(|pod| !pod.spec.node_name.is_empty());
    if use_greed {
        sort_pods_greedy(&mut unbound, &store.list_nodes());
    }
    sort_pods_affinity_first(&mut unbound);
    // the toleration sort runs last and wins ties over the affinity sort
    sort_pods_toleration_first(&mut unbound);
    ordered.extend(unbound);
    ordered
}

fn snapshot_node_status(store: &FakeCluster) -> Vec<NodeStatus> {
    store
        .list_nodes()
        .into_iter()
        .map(|node| {
            let pods = store.pods_on_node(&node.metadata.name);
            NodeStatus { node, pods }
        })
        .collect()
}
