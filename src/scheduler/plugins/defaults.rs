//! Reimplementations of the orchestrator's default predicates and
//! priorities, restricted to what the simulated workloads exercise.

use std::sync::Arc;

use crate::core::matching::{
    find_untolerated_taint, label_selector_matches, pod_fits_node_name,
    pod_matches_node_affinity,
};
use crate::core::node::Node;
use crate::core::pod::{Pod, PodAffinityTerm};
use crate::core::resources::{ResourceKind, RuntimeResources};
use crate::scheduler::framework::{
    normalize_min_max, CycleState, FilterPlugin, NodeScore, Plugin, ScorePlugin, StateData,
    Status,
};
use crate::scheduler::plugins::PluginHandles;
use crate::store::FakeCluster;

const POD_REQUESTS_STATE_KEY: &str = "PodRequests";

struct PodRequestsState {
    requests: RuntimeResources,
}
impl StateData for PodRequestsState {}

/// Requested resources of the pod in flight, computed once per cycle.
pub(crate) fn cycle_pod_requests(state: &mut CycleState, pod: &Pod) -> RuntimeResources {
    if let Some(cached) = state.read::<PodRequestsState>(POD_REQUESTS_STATE_KEY) {
        return cached.requests;
    }
    let requests = pod.calculate_requested_resources();
    state.write(POD_REQUESTS_STATE_KEY, Box::new(PodRequestsState { requests }));
    requests
}

// ---- NodeUnschedulable ----

pub struct NodeUnschedulable;

impl Plugin for NodeUnschedulable {
    fn name(&self) -> &'static str {
        "NodeUnschedulable"
    }
}

impl FilterPlugin for NodeUnschedulable {
    fn filter(&self, _state: &mut CycleState, _pod: &Pod, node: &Node) -> Status {
        if node.spec.unschedulable {
            return Status::unschedulable("node(s) were unschedulable");
        }
        Status::success()
    }
}

pub fn node_unschedulable_factory(_store: Arc<FakeCluster>) -> PluginHandles {
    PluginHandles {
        filter: Some(Arc::new(NodeUnschedulable)),
        ..Default::default()
    }
}

// ---- NodeName ----

pub struct NodeName;

impl Plugin for NodeName {
    fn name(&self) -> &'static str {
        "NodeName"
    }
}

impl FilterPlugin for NodeName {
    fn filter(&self, _state: &mut CycleState, pod: &Pod, node: &Node) -> Status {
        if !pod_fits_node_name(pod, node) {
            return Status::unschedulable("node(s) didn't match the requested node name");
        }
        Status::success()
    }
}

pub fn node_name_factory(_store: Arc<FakeCluster>) -> PluginHandles {
    PluginHandles {
        filter: Some(Arc::new(NodeName)),
        ..Default::default()
    }
}

// ---- TaintToleration ----

pub struct TaintToleration;

impl Plugin for TaintToleration {
    fn name(&self) -> &'static str {
        "TaintToleration"
    }
}

impl FilterPlugin for TaintToleration {
    fn filter(&self, _state: &mut CycleState, pod: &Pod, node: &Node) -> Status {
        match find_untolerated_taint(pod, &node.spec.taints) {
            Some(taint) => Status::unschedulable(format!(
                "node(s) had taint {{{}: {}}}, that the pod didn't tolerate",
                taint.key, taint.value
            )),
            None => Status::success(),
        }
    }
}

pub fn taint_toleration_factory(_store: Arc<FakeCluster>) -> PluginHandles {
    PluginHandles {
        filter: Some(Arc::new(TaintToleration)),
        ..Default::default()
    }
}

// ---- NodeAffinity ----

pub struct NodeAffinity;

impl Plugin for NodeAffinity {
    fn name(&self) -> &'static str {
        "NodeAffinity"
    }
}

impl FilterPlugin for NodeAffinity {
    fn filter(&self, _state: &mut CycleState, pod: &Pod, node: &Node) -> Status {
        if !pod_matches_node_affinity(pod, node) {
            return Status::unschedulable("node(s) didn't match Pod's node affinity/selector");
        }
        Status::success()
    }
}

pub fn node_affinity_factory(_store: Arc<FakeCluster>) -> PluginHandles {
    PluginHandles {
        filter: Some(Arc::new(NodeAffinity)),
        ..Default::default()
    }
}

// ---- NodeResourcesFit ----

pub struct NodeResourcesFit {
    store: Arc<FakeCluster>,
}

impl Plugin for NodeResourcesFit {
    fn name(&self) -> &'static str {
        "NodeResourcesFit"
    }
}

fn insufficient_reason(kind: ResourceKind) -> String {
    format!("Insufficient {}", kind.name())
}

impl FilterPlugin for NodeResourcesFit {
    fn filter(&self, state: &mut CycleState, pod: &Pod, node: &Node) -> Status {
        let requests = cycle_pod_requests(state, pod);
        if requests.is_zero() {
            return Status::success();
        }
        let available = match self.store.node_available(&node.metadata.name) {
            Some(available) => available,
            None => return Status::error(format!("node {:?} not in store", node.metadata.name)),
        };
        match requests.first_insufficient(&available) {
            Some(kind) => Status::unschedulable(insufficient_reason(kind)),
            None => Status::success(),
        }
    }
}

pub fn node_resources_fit_factory(store: Arc<FakeCluster>) -> PluginHandles {
    PluginHandles {
        filter: Some(Arc::new(NodeResourcesFit { store })),
        ..Default::default()
    }
}

// ---- NodeResourcesLeastAllocated ----

/// Prefers the node with the highest fraction of resources left after the
/// hypothetical placement; the spreading counterweight to Simon's packing.
pub struct LeastAllocated {
    store: Arc<FakeCluster>,
}

impl Plugin for LeastAllocated {
    fn name(&self) -> &'static str {
        "NodeResourcesLeastAllocated"
    }
}

impl ScorePlugin for LeastAllocated {
    fn score(&self, state: &mut CycleState, pod: &Pod, node: &Node) -> (i64, Status) {
        let requests = cycle_pod_requests(state, pod);
        let available = match self.store.node_available(&node.metadata.name) {
            Some(available) => available,
            None => {
                return (
                    0,
                    Status::error(format!("node {:?} not in store", node.metadata.name)),
                )
            }
        };
        let fraction = |free: i64, total: i64| -> f64 {
            if total <= 0 {
                0.0
            } else {
                (free.max(0)) as f64 * 100.0 / total as f64
            }
        };
        let cpu = fraction(available.cpu - requests.cpu, node.status.allocatable.cpu);
        let memory = fraction(
            available.memory - requests.memory,
            node.status.allocatable.memory,
        );
        (((cpu + memory) / 2.0) as i64, Status::success())
    }
}

pub fn least_allocated_factory(store: Arc<FakeCluster>) -> PluginHandles {
    PluginHandles {
        score: Some(Arc::new(LeastAllocated { store })),
        ..Default::default()
    }
}

// ---- InterPodAffinity ----

pub struct InterPodAffinity {
    store: Arc<FakeCluster>,
}

impl Plugin for InterPodAffinity {
    fn name(&self) -> &'static str {
        "InterPodAffinity"
    }
}

impl InterPodAffinity {
    /// Pods already bound to nodes in the candidate node's topology domain
    /// that match the term's label selector.
    fn matching_pods_in_domain(&self, term: &PodAffinityTerm, candidate: &Node) -> usize {
        let selector = match &term.label_selector {
            Some(selector) => selector,
            None => return 0,
        };
        let domain_value = match candidate.metadata.labels.get(&term.topology_key) {
            Some(value) => value.clone(),
            // a node without the topology key belongs to no domain
            None => return 0,
        };
        let nodes_in_domain: Vec<String> = self
            .store
            .list_nodes()
            .into_iter()
            .filter(|n| n.metadata.labels.get(&term.topology_key) == Some(&domain_value))
            .map(|n| n.metadata.name)
            .collect();
        self.store
            .list_pods()
            .iter()
            .filter(|p| !p.spec.node_name.is_empty())
            .filter(|p| nodes_in_domain.contains(&p.spec.node_name))
            .filter(|p| label_selector_matches(selector, &p.metadata.labels))
            .count()
    }
}

impl FilterPlugin for InterPodAffinity {
    fn filter(&self, _state: &mut CycleState, pod: &Pod, node: &Node) -> Status {
        let affinity = match &pod.spec.affinity {
            Some(affinity) => affinity,
            None => return Status::success(),
        };
        if let Some(pod_affinity) = &affinity.pod_affinity {
            for term in &pod_affinity.required {
                if self.matching_pods_in_domain(term, node) > 0 {
                    continue;
                }
                // the first pod of a self-selecting group may land anywhere
                // inside the topology
                let self_match = term
                    .label_selector
                    .as_ref()
                    .map(|s| label_selector_matches(s, &pod.metadata.labels))
                    .unwrap_or(false);
                let in_domain = node.metadata.labels.contains_key(&term.topology_key);
                if !(self_match && in_domain) {
                    return Status::unschedulable("node(s) didn't match pod affinity rules");
                }
            }
        }
        if let Some(anti_affinity) = &affinity.pod_anti_affinity {
            for term in &anti_affinity.required {
                if self.matching_pods_in_domain(term, node) > 0 {
                    return Status::unschedulable("node(s) didn't match pod anti-affinity rules");
                }
            }
        }
        Status::success()
    }
}

impl ScorePlugin for InterPodAffinity {
    fn score(&self, _state: &mut CycleState, pod: &Pod, node: &Node) -> (i64, Status) {
        let affinity = match &pod.spec.affinity {
            Some(affinity) => affinity,
            None => return (0, Status::success()),
        };
        let mut score: i64 = 0;
        if let Some(pod_affinity) = &affinity.pod_affinity {
            for weighted in &pod_affinity.preferred {
                score += weighted.weight
                    * self.matching_pods_in_domain(&weighted.pod_affinity_term, node) as i64;
            }
        }
        if let Some(anti_affinity) = &affinity.pod_anti_affinity {
            for weighted in &anti_affinity.preferred {
                score -= weighted.weight
                    * self.matching_pods_in_domain(&weighted.pod_affinity_term, node) as i64;
            }
        }
        (score, Status::success())
    }

    fn normalize(&self, _pod: &Pod, scores: &mut [NodeScore]) -> Status {
        normalize_min_max(scores);
        Status::success()
    }
}

pub fn inter_pod_affinity_factory(store: Arc<FakeCluster>) -> PluginHandles {
    let plugin = Arc::new(InterPodAffinity { store });
    PluginHandles {
        filter: Some(plugin.clone()),
        score: Some(plugin),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::common::DEFAULT_SCHEDULER_NAME;
    use crate::core::pod::{Container, ResourceRequirements};
    use crate::scheduler::framework::Code;

    fn store_with_node(cpu: i64, memory: i64) -> Arc<FakeCluster> {
        let store = Arc::new(FakeCluster::new());
        let mut node = Node::default();
        node.metadata.name = "node-1".to_string();
        node.status.allocatable.cpu = cpu;
        node.status.allocatable.memory = memory;
        node.status.capacity = node.status.allocatable;
        store.create_node(node).unwrap();
        store
    }

    fn requesting_pod(name: &str, cpu: i64, memory: i64) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = name.to_string();
        pod.metadata.namespace = "default".to_string();
        pod.spec.scheduler_name = DEFAULT_SCHEDULER_NAME.to_string();
        pod.spec.containers.push(Container {
            resources: ResourceRequirements {
                requests: RuntimeResources {
                    cpu,
                    memory,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_fit_reports_insufficient_cpu() {
        let store = store_with_node(1000, 4 << 30);
        let plugin = NodeResourcesFit {
            store: store.clone(),
        };
        let node = store.get_node("node-1").unwrap();
        let mut state = CycleState::new();
        let status = plugin.filter(&mut state, &requesting_pod("big", 2000, 1 << 30), &node);
        assert_eq!(Code::Unschedulable, status.code);
        assert!(status.message().contains("Insufficient cpu"));
    }

    #[test]
    fn test_fit_accounts_for_bound_pods() {
        let store = store_with_node(2000, 4 << 30);
        let mut bound = requesting_pod("bound", 1500, 1 << 30);
        bound.spec.node_name = "node-1".to_string();
        store.create_pod(bound).unwrap();

        let plugin = NodeResourcesFit {
            store: store.clone(),
        };
        let node = store.get_node("node-1").unwrap();
        let mut state = CycleState::new();
        let status = plugin.filter(&mut state, &requesting_pod("second", 1000, 1 << 30), &node);
        assert_eq!(Code::Unschedulable, status.code);
    }

    #[test]
    fn test_zero_request_pod_always_fits() {
        let store = store_with_node(0, 0);
        let plugin = NodeResourcesFit {
            store: store.clone(),
        };
        let node = store.get_node("node-1").unwrap();
        let mut state = CycleState::new();
        assert!(plugin
            .filter(&mut state, &requesting_pod("tiny", 0, 0), &node)
            .is_success());
    }
}
