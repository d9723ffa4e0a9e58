//! The node-evacuation planner: decide which workers can be drained without
//! leaving any pod unschedulable, and where their pods would move.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::core::cluster::ResourceTypes;
use crate::core::common::{
    OwnerReference, ANNO_ORIGINATED_FROM, LABEL_NON_REMOVABLE,
};
use crate::core::node::{Node, Taint};
use crate::core::pod::Pod;
use crate::error::SimonError;
use crate::simulator::expand::{make_valid_node, make_valid_pod};
use crate::simulator::{simulate, SimulateOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct PodPlan {
    pub pod_name: String,
    pub pod_namespace: String,
    pub from_node: String,
    pub to_node: String,
    pub pod_owner_refs: Vec<OwnerReference>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationStatus {
    pub node_name: String,
    pub is_removable: bool,
    pub reason: String,
    pub pod_plans: Vec<PodPlan>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationResult {
    pub nodes_migration_status: Vec<MigrationStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct DownScaler {
    pub nodes_to_be_removed: Vec<String>,
    pub label_filter: Vec<String>,
    pub maximum_average_utilization: i64,
}

/// node name → (node, pods bound to it); association is by name only, so
/// taints and annotations can be edited without invalidating anything.
type Layout = BTreeMap<String, (Node, Vec<Pod>)>;

fn build_layout(nodes: Vec<Node>, pods: Vec<Pod>) -> Layout {
    let mut layout: Layout = nodes
        .into_iter()
        .map(|node| (node.metadata.name.clone(), (node, vec![])))
        .collect();
    for pod in pods {
        if let Some((_, pod_list)) = layout.get_mut(&pod.spec.node_name) {
            pod_list.push(pod);
        }
    }
    layout
}

fn layout_to_cluster(layout: &Layout) -> ResourceTypes {
    let mut cluster = ResourceTypes::default();
    for (node, pods) in layout.values() {
        cluster.nodes.push(node.clone());
        cluster.pods.extend(pods.iter().cloned());
    }
    cluster
}

fn parse_label_filter(filters: &[String]) -> BTreeMap<String, String> {
    let mut parsed = BTreeMap::new();
    for filter in filters {
        match filter.split_once('=') {
            Some((key, value)) => {
                parsed.insert(key.to_string(), value.to_string());
            }
            None => warn!("ignoring malformed label filter {:?}", filter),
        }
    }
    parsed
}

/// Structural ineligibility: master role, the unschedulable taint, or a
/// hosted pod matching the user's label filter pin the node in place.
fn removability_reasons(
    node: &Node,
    pods: &[Pod],
    label_filter: &BTreeMap<String, String>,
) -> Option<String> {
    let mut reasons = vec![];
    if node.is_master() {
        reasons.push("Not a worker".to_string());
    }
    if node.has_unschedulable_taint() {
        reasons.push("Exist unschedulable taint".to_string());
    }
    if !label_filter.is_empty() {
        for pod in pods {
            let matched: Vec<String> = pod
                .metadata
                .labels
                .iter()
                .filter(|(key, value)| label_filter.get(*key) == Some(value))
                .map(|(key, value)| format!("{}={}", key, value))
                .collect();
            if !matched.is_empty() {
                reasons.push(format!(
                    "The pod({}/{}) exists label({})",
                    pod.metadata.namespace,
                    pod.metadata.name,
                    matched.join(";")
                ));
            }
        }
    }
    if reasons.is_empty() {
        None
    } else {
        Some(reasons.join("; "))
    }
}

fn utilization_score(node: &Node, pods: &[Pod]) -> i64 {
    let mut cpu = 0;
    let mut memory = 0;
    for pod in pods {
        if pod.is_owned_by_daemon_set() || pod.is_static_pod() || pod.is_mirror_pod() {
            continue;
        }
        let requested = pod.calculate_requested_resources();
        cpu += requested.cpu;
        memory += requested.memory;
    }
    let fraction = |used: i64, total: i64| -> i64 {
        if total <= 0 {
            0
        } else {
            used * 100 / total
        }
    };
    fraction(cpu, node.status.allocatable.cpu) + fraction(memory, node.status.allocatable.memory)
}

fn select_minimum_utilization_node(remove_list: &[String], layout: &Layout) -> Option<String> {
    let mut min_score = 201;
    let mut selected = None;
    for name in remove_list {
        if let Some((node, pods)) = layout.get(name) {
            if pods.is_empty() {
                return Some(name.clone());
            }
            let score = utilization_score(node, pods);
            if score < min_score {
                min_score = score;
                selected = Some(name.clone());
            }
        }
    }
    selected
}

/// Drops daemon-set, static and mirror pods (they are never migrated),
/// marks the survivors with their origin, clears their bindings and taints
/// the node.
fn drain_node_in_layout(layout: &mut Layout, node_name: &str) {
    if let Some((node, pods)) = layout.get_mut(node_name) {
        pods.retain(|pod| {
            !pod.is_owned_by_daemon_set() && !pod.is_static_pod() && !pod.is_mirror_pod()
        });
        for pod in pods.iter_mut() {
            if !pod.metadata.annotations.contains_key(ANNO_ORIGINATED_FROM) {
                pod.metadata
                    .set_annotation(ANNO_ORIGINATED_FROM, node_name);
            }
            pod.spec.node_name = String::new();
        }
        if !node.has_unschedulable_taint() {
            node.spec.taints.push(Taint::unschedulable());
        }
    }
}

fn average_utilization(layout: &Layout) -> i64 {
    let mut total = 0;
    let mut counted = 0;
    for (node, pods) in layout.values() {
        if node.has_unschedulable_taint() {
            continue;
        }
        total += utilization_score(node, pods) / 2;
        counted += 1;
    }
    if counted == 0 {
        0
    } else {
        total / counted
    }
}

fn migration_statuses_for_removable(
    removable: &[String],
    layout: &Layout,
) -> Vec<MigrationStatus> {
    let mut statuses: Vec<MigrationStatus> = removable
        .iter()
        .map(|name| MigrationStatus {
            node_name: name.clone(),
            is_removable: true,
            reason: String::new(),
            pod_plans: vec![],
        })
        .collect();

    for (_, pods) in layout.values() {
        for pod in pods {
            let origin = match pod.metadata.annotations.get(ANNO_ORIGINATED_FROM) {
                Some(origin) => origin,
                None => continue,
            };
            if let Some(status) = statuses.iter_mut().find(|s| &s.node_name == origin) {
                status.pod_plans.push(PodPlan {
                    pod_name: pod.metadata.name.clone(),
                    pod_namespace: pod.metadata.namespace.clone(),
                    from_node: origin.clone(),
                    to_node: pod.spec.node_name.clone(),
                    pod_owner_refs: pod.metadata.owner_references.clone(),
                });
            }
        }
    }
    for status in statuses.iter_mut() {
        status.pod_plans.sort_by(|a, b| {
            (&a.pod_namespace, &a.pod_name).cmp(&(&b.pod_namespace, &b.pod_name))
        });
    }
    statuses
}

/// Iteratively picks the lowest-utilization worker from the remove list,
/// drains it and re-simulates; each worker ends up removable (with its pod
/// migration plan) or non-removable (with the failure reason).
pub fn scale_down_cluster(
    cluster: &ResourceTypes,
    mut remove_list: Vec<String>,
    label_filter: &[String],
    maximum_average_utilization: i64,
) -> Result<MigrationResult, SimonError> {
    let mut normalized_nodes = vec![];
    for node in &cluster.nodes {
        normalized_nodes.push(make_valid_node(node)?);
    }
    let mut normalized_pods = vec![];
    for pod in &cluster.pods {
        normalized_pods.push(make_valid_pod(pod)?);
    }

    let mut src_layout = build_layout(normalized_nodes, normalized_pods);
    let parsed_filter = parse_label_filter(label_filter);
    let mut statuses = vec![];

    for name in remove_list.clone() {
        let (node, pods) = match src_layout.get(&name) {
            Some((node, pods)) => (node, pods),
            None => {
                statuses.push(MigrationStatus {
                    node_name: name.clone(),
                    is_removable: false,
                    reason: "node not found".to_string(),
                    pod_plans: vec![],
                });
                remove_list.retain(|n| n != &name);
                continue;
            }
        };
        if let Some(reason) = removability_reasons(node, pods, &parsed_filter) {
            statuses.push(MigrationStatus {
                node_name: name.clone(),
                is_removable: false,
                reason,
                pod_plans: vec![],
            });
            remove_list.retain(|n| n != &name);
            if let Some((node, _)) = src_layout.get_mut(&name) {
                node.metadata.set_label(LABEL_NON_REMOVABLE, "");
            }
        }
    }

    let mut dst_layout = src_layout.clone();
    let mut removable = vec![];

    while !remove_list.is_empty() {
        let selected = match select_minimum_utilization_node(&remove_list, &dst_layout) {
            Some(selected) => selected,
            None => break,
        };

        let mut attempt = dst_layout.clone();
        drain_node_in_layout(&mut attempt, &selected);

        let result = simulate(&layout_to_cluster(&attempt), &[], &SimulateOptions::default())?;
        if result.unscheduled_pods.is_empty() {
            info!("node {} is removable", selected);
            removable.push(selected.clone());
            dst_layout = build_layout(
                result
                    .node_status
                    .iter()
                    .map(|status| status.node.clone())
                    .collect(),
                result
                    .node_status
                    .iter()
                    .flat_map(|status| status.pods.iter().cloned())
                    .collect(),
            );
            let average = average_utilization(&dst_layout);
            if average > maximum_average_utilization {
                info!(
                    "average utilization {}% exceeds the {}% ceiling, stopping",
                    average, maximum_average_utilization
                );
                remove_list.retain(|n| n != &selected);
                break;
            }
        } else {
            let reason = result
                .unscheduled_pods
                .iter()
                .map(|entry| entry.reason.clone())
                .collect::<Vec<_>>()
                .join("\n");
            statuses.push(MigrationStatus {
                node_name: selected.clone(),
                is_removable: false,
                reason,
                pod_plans: vec![],
            });
        }
        remove_list.retain(|n| n != &selected);
    }

    statuses.extend(migration_statuses_for_removable(&removable, &dst_layout));
    Ok(MigrationResult {
        nodes_migration_status: statuses,
    })
}

impl DownScaler {
    pub fn new(
        nodes_to_be_removed: Vec<String>,
        label_filter: Vec<String>,
        maximum_average_utilization: i64,
    ) -> Self {
        DownScaler {
            nodes_to_be_removed,
            label_filter,
            maximum_average_utilization,
        }
    }

    fn make_remove_list(&self, nodes: &[Node]) -> Vec<String> {
        if !self.nodes_to_be_removed.is_empty() {
            return self.nodes_to_be_removed.clone();
        }
        nodes.iter().map(|n| n.metadata.name.clone()).collect()
    }

    pub fn migrate(&self, cluster: &ResourceTypes) -> Result<MigrationResult, SimonError> {
        scale_down_cluster(
            cluster,
            self.make_remove_list(&cluster.nodes),
            &self.label_filter,
            self.maximum_average_utilization,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::common::LABEL_MASTER_ROLE;

    fn worker(name: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = name.to_string();
        node.status.allocatable.cpu = 8000;
        node.status.allocatable.memory = 16 << 30;
        node.status.capacity = node.status.allocatable;
        node
    }

    #[test]
    fn test_master_is_structurally_non_removable() {
        let mut master = worker("master-1");
        master.metadata.set_label(LABEL_MASTER_ROLE, "");
        let reason = removability_reasons(&master, &[], &BTreeMap::new()).unwrap();
        assert!(reason.contains("Not a worker"));
    }

    #[test]
    fn test_label_filter_pins_node() {
        let node = worker("worker-1");
        let mut pod = Pod::default();
        pod.metadata.name = "guard".to_string();
        pod.metadata.namespace = "default".to_string();
        pod.metadata.set_label("app", "critical");
        let filter = BTreeMap::from([("app".to_string(), "critical".to_string())]);
        let reason = removability_reasons(&node, &[pod], &filter).unwrap();
        assert!(reason.contains("app=critical"));
    }

    #[test]
    fn test_drain_preserves_daemon_and_static_pods() {
        let mut layout = Layout::new();
        let mut daemon_pod = Pod::default();
        daemon_pod.metadata.name = "proxy".to_string();
        daemon_pod
            .metadata
            .owner_references
            .push(OwnerReference::new("DaemonSet", "proxy"));
        daemon_pod.spec.node_name = "worker-1".to_string();
        let mut app_pod = Pod::default();
        app_pod.metadata.name = "app".to_string();
        app_pod.spec.node_name = "worker-1".to_string();
        layout.insert(
            "worker-1".to_string(),
            (worker("worker-1"), vec![daemon_pod, app_pod]),
        );

        drain_node_in_layout(&mut layout, "worker-1");
        let (node, pods) = layout.get("worker-1").unwrap();
        assert!(node.has_unschedulable_taint());
        assert_eq!(1, pods.len());
        assert_eq!("app", pods[0].metadata.name);
        assert!(pods[0].spec.node_name.is_empty());
        assert_eq!(
            Some(&"worker-1".to_string()),
            pods[0].metadata.annotations.get(ANNO_ORIGINATED_FROM)
        );
    }
}
