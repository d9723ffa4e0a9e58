//! Whole-cluster compaction: repeatedly drain the lowest-utilization worker
//! and re-simulate, until a drain stops fitting. The output is the list of
//! pod moves that survived every successful pass.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::core::cluster::ResourceTypes;
use crate::core::common::{OwnerReference, ANNO_ORIGINATED_FROM};
use crate::core::node::{Node, Taint};
use crate::core::pod::Pod;
use crate::error::SimonError;
use crate::simulator::expand::{make_valid_node, make_valid_pod};
use crate::simulator::{simulate, SimulateOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct DeschedulePlan {
    pub pod_name: String,
    pub pod_namespace: String,
    pub from_node: String,
    pub to_node: String,
    pub pod_owner_refs: Vec<OwnerReference>,
}

fn node_utilization_score(node: &Node, pods: &[Pod]) -> i64 {
    let mut cpu = 0;
    let mut memory = 0;
    for pod in pods
        .iter()
        .filter(|p| p.spec.node_name == node.metadata.name)
    {
        if pod.is_owned_by_daemon_set() || pod.is_static_pod() || pod.is_mirror_pod() {
            continue;
        }
        let requested = pod.calculate_requested_resources();
        cpu += requested.cpu;
        memory += requested.memory;
    }
    let allocatable = &node.status.allocatable;
    let fraction = |used: i64, total: i64| -> i64 {
        if total <= 0 {
            0
        } else {
            used * 100 / total
        }
    };
    fraction(cpu, allocatable.cpu) + fraction(memory, allocatable.memory)
}

fn select_lowest_utilization_worker<'a>(nodes: &'a [Node], pods: &[Pod]) -> Option<&'a Node> {
    if nodes.len() <= 1 {
        return None;
    }
    let mut min_score = 200;
    let mut selected = None;
    for node in nodes {
        if node.is_master() || node.has_unschedulable_taint() {
            continue;
        }
        let score = node_utilization_score(node, pods);
        if score < min_score {
            min_score = score;
            selected = Some(node);
        }
    }
    selected
}

/// One pass per node at most: drain the emptiest worker, re-simulate, keep
/// the new layout while every displaced pod still schedules.
pub fn run_deschedule(
    nodes: &[Node],
    pods: &[Pod],
) -> Result<Vec<DeschedulePlan>, SimonError> {
    let mut working_nodes = vec![];
    for node in nodes {
        working_nodes.push(make_valid_node(node)?);
    }
    let mut working_pods = vec![];
    for pod in pods {
        working_pods.push(make_valid_pod(pod)?);
    }

    // final landing node per pod key
    let mut destinations: BTreeMap<String, String> = BTreeMap::new();
    for pod in &working_pods {
        destinations.insert(pod.key(), pod.spec.node_name.clone());
    }

    for _ in 1..working_nodes.len() {
        let selected = match select_lowest_utilization_worker(&working_nodes, &working_pods) {
            Some(node) => node.metadata.name.clone(),
            None => break,
        };

        let mut attempt_pods = working_pods.clone();
        for pod in attempt_pods.iter_mut() {
            if pod.spec.node_name != selected {
                continue;
            }
            if pod.is_owned_by_daemon_set() || pod.is_static_pod() || pod.is_mirror_pod() {
                continue;
            }
            pod.metadata
                .set_annotation(ANNO_ORIGINATED_FROM, &selected);
            pod.spec.node_name = String::new();
        }
        let mut attempt_nodes = working_nodes.clone();
        for node in attempt_nodes.iter_mut() {
            if node.metadata.name == selected && !node.has_unschedulable_taint() {
                node.spec.taints.push(Taint::unschedulable());
            }
        }

        let attempt = ResourceTypes {
            nodes: attempt_nodes.clone(),
            pods: attempt_pods,
            ..Default::default()
        };
        let result = simulate(&attempt, &[], &SimulateOptions::default())?;
        if !result.unscheduled_pods.is_empty() {
            debug!(
                "stop descheduling: draining {} leaves {} pod(s) unschedulable",
                selected,
                result.unscheduled_pods.len()
            );
            break;
        }

        info!("node {} can be drained", selected);
        working_nodes = attempt_nodes;
        working_pods = vec![];
        for status in &result.node_status {
            for pod in &status.pods {
                destinations.insert(pod.key(), pod.spec.node_name.clone());
                working_pods.push(pod.clone());
            }
        }
    }

    let mut plans = vec![];
    for pod in pods {
        let from_node = pod.spec.node_name.clone();
        let key = format!(
            "{}/{}",
            if pod.metadata.namespace.is_empty() {
                crate::core::common::NAMESPACE_DEFAULT
            } else {
                &pod.metadata.namespace
            },
            pod.metadata.name
        );
        let to_node = match destinations.get(&key) {
            Some(to_node) => to_node.clone(),
            None => continue,
        };
        if from_node != to_node {
            plans.push(DeschedulePlan {
                pod_name: pod.metadata.name.clone(),
                pod_namespace: pod.metadata.namespace.clone(),
                from_node,
                to_node,
                pod_owner_refs: pod.metadata.owner_references.clone(),
            });
        }
    }
    plans.sort_by(|a, b| {
        (&a.pod_namespace, &a.pod_name).cmp(&(&b.pod_namespace, &b.pod_name))
    });
    Ok(plans)
}
