//! Utilization reporting over a simulation result: per-node and per-pod
//! rows plus per-VG/per-device lines for nodes carrying local storage.
//! The core computes plain rows; rendering is a thin prettytable layer.

use average::{concatenate, Estimate, Max, Mean, Min};
use prettytable::{row, Table};

use crate::core::common::{LABEL_APP_NAME, LABEL_NEW_NODE};
use crate::core::pod::Pod;
use crate::core::resources::RuntimeResources;
use crate::simulator::{NodeStatus, SimulateResult};

concatenate!(Estimator, [Min, min], [Max, max], [Mean, mean]);

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub name: String,
    pub cpu_allocatable: i64,
    pub cpu_requested: i64,
    pub cpu_fraction: f64,
    pub memory_allocatable: i64,
    pub memory_requested: i64,
    pub memory_fraction: f64,
    pub pod_count: usize,
    pub is_new_node: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodRow {
    pub node: String,
    pub namespace: String,
    pub name: String,
    pub app_name: String,
    pub cpu: i64,
    pub cpu_fraction: f64,
    pub memory: i64,
    pub memory_fraction: f64,
    pub volumes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageRow {
    pub node: String,
    pub kind: String,
    pub name: String,
    pub capacity: i64,
    pub used: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterSummary {
    pub cpu_fraction_min: f64,
    pub cpu_fraction_max: f64,
    pub cpu_fraction_mean: f64,
    pub memory_fraction_min: f64,
    pub memory_fraction_max: f64,
    pub memory_fraction_mean: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub nodes: Vec<NodeRow>,
    pub pods: Vec<PodRow>,
    pub storage: Vec<StorageRow>,
    pub summary: ClusterSummary,
}

fn fraction(requested: i64, allocatable: i64) -> f64 {
    if allocatable <= 0 {
        0.0
    } else {
        requested as f64 * 100.0 / allocatable as f64
    }
}

/// "10Gi", "512Mi" or plain bytes.
pub fn format_bytes(bytes: i64) -> String {
    const GIB: i64 = 1 << 30;
    const MIB: i64 = 1 << 20;
    if bytes >= GIB && bytes % GIB == 0 {
        format!("{}Gi", bytes / GIB)
    } else if bytes >= MIB && bytes % MIB == 0 {
        format!("{}Mi", bytes / MIB)
    } else {
        bytes.to_string()
    }
}

fn pod_volume_summary(pod: &Pod) -> Vec<String> {
    match pod.volume_request() {
        Some(request) => request
            .volumes
            .iter()
            .map(|claim| {
                format!(
                    "{} {}",
                    serde_json::to_value(claim.kind)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default(),
                    format_bytes(claim.size)
                )
            })
            .collect(),
        None => vec![],
    }
}

fn node_rows(status: &NodeStatus) -> (NodeRow, Vec<PodRow>, Vec<StorageRow>) {
    let node = &status.node;
    let allocatable = &node.status.allocatable;
    let mut requested = RuntimeResources::default();
    for pod in &status.pods {
        requested.add(&pod.calculate_requested_resources());
    }

    let node_row = NodeRow {
        name: node.metadata.name.clone(),
        cpu_allocatable: allocatable.cpu,
        cpu_requested: requested.cpu,
        cpu_fraction: fraction(requested.cpu, allocatable.cpu),
        memory_allocatable: allocatable.memory,
        memory_requested: requested.memory,
        memory_fraction: fraction(requested.memory, allocatable.memory),
        pod_count: status.pods.len(),
        is_new_node: node.metadata.has_label(LABEL_NEW_NODE),
    };

    let pod_rows = status
        .pods
        .iter()
        .map(|pod| {
            let pod_requested = pod.calculate_requested_resources();
            PodRow {
                node: node.metadata.name.clone(),
                namespace: pod.metadata.namespace.clone(),
                name: pod.metadata.name.clone(),
                app_name: pod
                    .metadata
                    .labels
                    .get(LABEL_APP_NAME)
                    .cloned()
                    .unwrap_or_default(),
                cpu: pod_requested.cpu,
                cpu_fraction: fraction(pod_requested.cpu, allocatable.cpu),
                memory: pod_requested.memory,
                memory_fraction: fraction(pod_requested.memory, allocatable.memory),
                volumes: pod_volume_summary(pod),
            }
        })
        .collect();

    let mut storage_rows = vec![];
    if let Some(storage) = node.local_storage() {
        for vg in &storage.vgs {
            storage_rows.push(StorageRow {
                node: node.metadata.name.clone(),
                kind: "VG".to_string(),
                name: vg.name.clone(),
                capacity: vg.capacity,
                used: vg.requested,
            });
        }
        for device in &storage.devices {
            storage_rows.push(StorageRow {
                node: node.metadata.name.clone(),
                kind: "Device".to_string(),
                name: device.device.clone(),
                capacity: device.capacity,
                used: if device.is_allocated {
                    device.capacity
                } else {
                    0
                },
            });
        }
    }

    (node_row, pod_rows, storage_rows)
}

pub fn build_report(result: &SimulateResult) -> Report {
    let mut report = Report::default();
    let mut cpu_stats = Estimator::new();
    let mut memory_stats = Estimator::new();

    for status in &result.node_status {
        let (node_row, pod_rows, storage_rows) = node_rows(status);
        cpu_stats.add(node_row.cpu_fraction);
        memory_stats.add(node_row.memory_fraction);
        report.nodes.push(node_row);
        report.pods.extend(pod_rows);
        report.storage.extend(storage_rows);
    }
    if !report.nodes.is_empty() {
        report.summary = ClusterSummary {
            cpu_fraction_min: cpu_stats.min(),
            cpu_fraction_max: cpu_stats.max(),
            cpu_fraction_mean: cpu_stats.mean(),
            memory_fraction_min: memory_stats.min(),
            memory_fraction_max: memory_stats.max(),
            memory_fraction_mean: memory_stats.mean(),
        };
    }
    report
}

pub fn print_report(report: &Report) {
    let mut node_table = Table::new();
    node_table.add_row(row![
        "Node", "CPU Allocatable", "CPU Requested", "CPU %", "Memory Allocatable",
        "Memory Requested", "Memory %", "Pods", "New Node"
    ]);
    for node in &report.nodes {
        node_table.add_row(row![
            node.name,
            format!("{}m", node.cpu_allocatable),
            format!("{}m", node.cpu_requested),
            format!("{:.1}", node.cpu_fraction),
            format_bytes(node.memory_allocatable),
            format_bytes(node.memory_requested),
            format!("{:.1}", node.memory_fraction),
            node.pod_count,
            if node.is_new_node { "yes" } else { "" }
        ]);
    }
    node_table.printstd();

    let mut pod_table = Table::new();
    pod_table.add_row(row![
        "Node", "Pod", "App", "CPU", "CPU %", "Memory", "Memory %", "Volumes"
    ]);
    for pod in &report.pods {
        pod_table.add_row(row![
            pod.node,
            format!("{}/{}", pod.namespace, pod.name),
            pod.app_name,
            format!("{}m", pod.cpu),
            format!("{:.1}", pod.cpu_fraction),
            format_bytes(pod.memory),
            format!("{:.1}", pod.memory_fraction),
            pod.volumes.join(", ")
        ]);
    }
    pod_table.printstd();

    if !report.storage.is_empty() {
        let mut storage_table = Table::new();
        storage_table.add_row(row!["Node", "Kind", "Name", "Capacity", "Used"]);
        for storage in &report.storage {
            storage_table.add_row(row![
                storage.node,
                storage.kind,
                storage.name,
                format_bytes(storage.capacity),
                format_bytes(storage.used)
            ]);
        }
        storage_table.printstd();
    }

    let mut summary_table = Table::new();
    summary_table.add_row(row!["Metric", "Min", "Max", "Mean"]);
    summary_table.add_row(row![
        "CPU %",
        format!("{:.1}", report.summary.cpu_fraction_min),
        format!("{:.1}", report.summary.cpu_fraction_max),
        format!("{:.1}", report.summary.cpu_fraction_mean)
    ]);
    summary_table.add_row(row![
        "Memory %",
        format!("{:.1}", report.summary.memory_fraction_min),
        format!("{:.1}", report.summary.memory_fraction_max),
        format!("{:.1}", report.summary.memory_fraction_mean)
    ]);
    summary_table.printstd();
}
