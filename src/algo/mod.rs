//! Pod queue sort policies applied before dispatch, plus the node ordering
//! used by the placement config map.

use crate::core::common::NEW_NODE_NAME_PREFIX;
use crate::core::node::Node;
use crate::core::pod::Pod;
use crate::core::resources::RuntimeResources;

/// The share of `alloc` against `total`, saturating at 1 when the total is
/// exhausted.
pub fn share(alloc: f64, total: f64) -> f64 {
    if total <= 0.0 {
        if alloc <= 0.0 {
            0.0
        } else {
            1.0
        }
    } else {
        alloc / total
    }
}

fn dominant_share(pod: &Pod, total: &RuntimeResources) -> f64 {
    let requested = pod.calculate_requested_resources();
    if requested.is_zero() {
        return 0.0;
    }
    let mut dominant = 0.0_f64;
    for (kind, value) in requested.iter() {
        let resource_share = share(value as f64, total.get(kind) as f64);
        if resource_share > dominant {
            dominant = resource_share;
        }
    }
    dominant
}

/// Greedy order: dominant-resource-share descending, so the hungriest pods
/// are placed while the cluster is still empty.
pub fn sort_pods_greedy(pods: &mut [Pod], nodes: &[Node]) {
    let mut total = RuntimeResources::default();
    for node in nodes {
        total.add(&node.status.allocatable);
    }
    pods.sort_by(|a, b| {
        dominant_share(b, &total).total_cmp(&dominant_share(a, &total))
    });
}

fn has_placement_constraint(pod: &Pod) -> bool {
    if !pod.spec.node_selector.is_empty() {
        return true;
    }
    pod.spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required.as_ref())
        .is_some()
}

/// Pods constrained by a node selector or required node affinity are placed
/// before unconstrained ones. Stable.
pub fn sort_pods_affinity_first(pods: &mut [Pod]) {
    pods.sort_by_key(|pod| !has_placement_constraint(pod));
}

/// Pods carrying tolerations are placed before the rest. Stable, applied
/// after the affinity sort so it wins ties.
pub fn sort_pods_toleration_first(pods: &mut [Pod]) {
    pods.sort_by_key(|pod| pod.spec.tolerations.is_empty());
}

fn is_new_node_name(name: &str) -> bool {
    name.starts_with(&format!("{}-", NEW_NODE_NAME_PREFIX))
}

/// Pre-existing nodes first, synthetic nodes last, lexicographic within
/// each partition.
pub fn adjust_nodes_order(nodes: &mut [String]) {
    nodes.sort_by(|a, b| {
        is_new_node_name(a)
            .cmp(&is_new_node_name(b))
            .then_with(|| a.cmp(b))
    });
}
