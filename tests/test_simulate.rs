use std::collections::{BTreeMap, BTreeSet};

use simon::core::cluster::{AppResource, ResourceTypes};
use simon::core::common::{
    ANNO_WORKLOAD_NAME, LABEL_MASTER_ROLE, TAINT_EFFECT_NO_SCHEDULE,
};
use simon::core::node::Taint;
use simon::core::pod::{
    Affinity, LabelSelector, LabelSelectorOperator, LabelSelectorRequirement, NodeAffinity,
    NodeSelector, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm, PodAffinity,
    PodAffinityTerm, Toleration, TolerationOperator, WeightedPodAffinityTerm,
};
use simon::core::resources::RuntimeResources;
use simon::simulator::{simulate, SimulateOptions, SimulateResult};
use simon::test_util::*;

const OS_LABEL: &str = "beta.kubernetes.io/os";
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
const WORKER_ROLE: &str = "node-role.kubernetes.io/worker";

fn master_taint() -> Taint {
    Taint {
        key: LABEL_MASTER_ROLE.to_string(),
        value: String::new(),
        effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
    }
}

fn master_toleration() -> Toleration {
    Toleration {
        key: LABEL_MASTER_ROLE.to_string(),
        operator: TolerationOperator::Exists,
        value: String::new(),
        effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
    }
}

fn tolerate_everything() -> Toleration {
    Toleration {
        operator: TolerationOperator::Exists,
        ..Default::default()
    }
}

fn node_affinity(key: &str, operator: NodeSelectorOperator) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: vec![NodeSelectorRequirement {
                        key: key.to_string(),
                        operator,
                        values: vec![],
                    }],
                }],
            }),
        }),
        ..Default::default()
    }
}

fn preferred_anti_affinity_on_hostname(app: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAffinity {
            preferred: vec![WeightedPodAffinityTerm {
                weight: 100,
                pod_affinity_term: PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_expressions: vec![LabelSelectorRequirement {
                            key: "app".to_string(),
                            operator: LabelSelectorOperator::In,
                            values: vec![app.to_string()],
                        }],
                        ..Default::default()
                    }),
                    topology_key: HOSTNAME_LABEL.to_string(),
                },
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tiny_cluster() -> ResourceTypes {
    let mut cluster = ResourceTypes::default();
    for index in 1..=3 {
        cluster.nodes.push(make_fake_node(
            &format!("master-{}", index),
            "8",
            "16Gi",
            vec![
                with_node_labels(&[(LABEL_MASTER_ROLE, ""), (OS_LABEL, "linux")]),
                with_node_taints(vec![master_taint()]),
            ],
        ));
    }
    cluster.nodes.push(make_fake_node(
        "worker-1",
        "8",
        "16Gi",
        vec![with_node_labels(&[(WORKER_ROLE, ""), (OS_LABEL, "linux")])],
    ));

    // static control-plane pods pinned to master-1
    cluster.pods.push(make_fake_pod(
        "etcd-master-1",
        "kube-system",
        "",
        "",
        vec![with_pod_node_name("master-1")],
    ));
    cluster.pods.push(make_fake_pod(
        "kube-apiserver-master-1",
        "kube-system",
        "250m",
        "",
        vec![with_pod_node_name("master-1")],
    ));
    cluster.pods.push(make_fake_pod(
        "kube-controller-manager-master-1",
        "kube-system",
        "200m",
        "",
        vec![with_pod_node_name("master-1")],
    ));
    cluster.pods.push(make_fake_pod(
        "kube-scheduler-master-1",
        "kube-system",
        "100m",
        "",
        vec![with_pod_node_name("master-1")],
    ));

    cluster.daemon_sets.push(make_fake_daemon_set(
        "kube-proxy-master",
        "kube-system",
        "",
        "",
        vec![
            with_daemon_set_tolerations(vec![tolerate_everything()]),
            with_daemon_set_node_selector(&[(LABEL_MASTER_ROLE, "")]),
        ],
    ));
    cluster.daemon_sets.push(make_fake_daemon_set(
        "kube-proxy-worker",
        "kube-system",
        "",
        "",
        vec![
            with_daemon_set_tolerations(vec![tolerate_everything()]),
            with_daemon_set_node_selector(&[(WORKER_ROLE, "")]),
        ],
    ));
    cluster.daemon_sets.push(make_fake_daemon_set(
        "coredns",
        "kube-system",
        "100m",
        "70Mi",
        vec![
            with_daemon_set_affinity(node_affinity(
                LABEL_MASTER_ROLE,
                NodeSelectorOperator::Exists,
            )),
            with_daemon_set_tolerations(vec![Toleration {
                key: LABEL_MASTER_ROLE.to_string(),
                effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
                ..Default::default()
            }]),
            with_daemon_set_node_selector(&[(OS_LABEL, "linux")]),
        ],
    ));
    cluster
}

fn simple_app(deployment_replicas: i32) -> AppResource {
    let mut resource = ResourceTypes::default();
    resource.deployments.push(make_fake_deployment(
        "busybox-deploy",
        "simple",
        deployment_replicas,
        "1500m",
        "1Gi",
        vec![with_deployment_tolerations(vec![master_toleration()])],
    ));
    resource.daemon_sets.push(make_fake_daemon_set(
        "busybox-ds",
        "simple",
        "500m",
        "512Mi",
        vec![
            with_daemon_set_node_selector(&[(OS_LABEL, "linux")]),
            with_daemon_set_affinity(node_affinity(
                LABEL_MASTER_ROLE,
                NodeSelectorOperator::DoesNotExist,
            )),
        ],
    ));
    resource
        .jobs
        .push(make_fake_job("pi", "default", 1, "100m", "100Mi"));
    resource.pods.push(make_fake_pod(
        "single-pod",
        "simple",
        "100m",
        "100Mi",
        vec![
            with_pod_node_selector(&[(LABEL_MASTER_ROLE, "")]),
            with_pod_tolerations(vec![master_toleration()]),
        ],
    ));
    resource.stateful_sets.push(make_fake_stateful_set(
        "busybox-sts",
        "simple",
        4,
        "1",
        "512Mi",
        vec![
            with_stateful_set_tolerations(vec![master_toleration()]),
            with_stateful_set_affinity(preferred_anti_affinity_on_hostname("busybox-sts")),
        ],
    ));
    AppResource {
        name: "simple".to_string(),
        resource,
    }
}

fn workload_placements(result: &SimulateResult) -> BTreeMap<String, Vec<String>> {
    let mut placements: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for status in &result.node_status {
        for pod in &status.pods {
            let workload = pod
                .metadata
                .annotations
                .get(ANNO_WORKLOAD_NAME)
                .cloned()
                .unwrap_or_else(|| pod.metadata.name.clone());
            placements
                .entry(workload)
                .or_default()
                .push(status.node.metadata.name.clone());
        }
    }
    placements
}

fn assert_capacity_invariant(result: &SimulateResult) {
    for status in &result.node_status {
        let mut requested = RuntimeResources::default();
        for pod in &status.pods {
            requested.add(&pod.calculate_requested_resources());
        }
        let allocatable = &status.node.status.allocatable;
        assert!(
            requested.cpu <= allocatable.cpu,
            "node {}: cpu {} > allocatable {}",
            status.node.metadata.name,
            requested.cpu,
            allocatable.cpu
        );
        assert!(
            requested.memory <= allocatable.memory,
            "node {}: memory over allocatable",
            status.node.metadata.name
        );
    }
}

#[test]
fn test_tiny_cluster_schedules_completely() {
    let _ = env_logger::try_init();

    let cluster = tiny_cluster();
    let apps = vec![simple_app(4)];
    let result = simulate(&cluster, &apps, &SimulateOptions::default()).unwrap();

    assert!(
        result.unscheduled_pods.is_empty(),
        "unexpected failures: {:?}",
        result
            .unscheduled_pods
            .iter()
            .map(|p| (p.pod.key(), p.reason.clone()))
            .collect::<Vec<_>>()
    );

    // every expanded pod is bound exactly once:
    // 4 static + 3 kube-proxy-master + 1 kube-proxy-worker + 3 coredns
    // + 4 deploy + 1 busybox-ds + 1 pi + 1 single + 4 sts = 22
    let bound: usize = result.node_status.iter().map(|s| s.pods.len()).sum();
    assert_eq!(22, bound);

    let key_set: BTreeSet<String> = result
        .node_status
        .iter()
        .flat_map(|s| s.pods.iter().map(|p| p.key()))
        .collect();
    assert_eq!(22, key_set.len(), "a pod appears on two nodes");

    assert_capacity_invariant(&result);

    let placements = workload_placements(&result);
    let masters: BTreeSet<&str> = ["master-1", "master-2", "master-3"].into();

    let proxy_master = &placements["kube-proxy-master"];
    assert_eq!(3, proxy_master.len());
    assert!(proxy_master.iter().all(|n| masters.contains(n.as_str())));

    assert_eq!(vec!["worker-1"], placements["kube-proxy-worker"]);

    let coredns = &placements["coredns"];
    assert_eq!(3, coredns.len());
    assert!(coredns.iter().all(|n| masters.contains(n.as_str())));

    assert_eq!(vec!["worker-1"], placements["busybox-ds"]);
    assert_eq!(4, placements["busybox-deploy"].len());
    assert_eq!(1, placements["pi"].len());

    // the pinned standalone pod lands on a master
    let single = &placements["single-pod"];
    assert_eq!(1, single.len());
    assert!(masters.contains(single[0].as_str()));

    // preferred anti-affinity spreads the stateful set
    let sts_nodes: BTreeSet<&String> = placements["busybox-sts"].iter().collect();
    assert_eq!(4, placements["busybox-sts"].len());
    assert!(
        sts_nodes.len() >= 2,
        "stateful set packed onto one node: {:?}",
        sts_nodes
    );
}

#[test]
fn test_over_commit_reports_insufficient_cpu() {
    let _ = env_logger::try_init();

    let cluster = tiny_cluster();
    let apps = vec![simple_app(20)];
    let result = simulate(&cluster, &apps, &SimulateOptions::default()).unwrap();

    assert!(!result.unscheduled_pods.is_empty());
    assert!(
        result
            .unscheduled_pods
            .iter()
            .any(|p| p.reason.to_lowercase().contains("insufficient cpu")),
        "reasons: {:?}",
        result
            .unscheduled_pods
            .iter()
            .map(|p| p.reason.clone())
            .collect::<Vec<_>>()
    );

    // conservation still holds: bound + unscheduled covers every pod once
    let bound: usize = result.node_status.iter().map(|s| s.pods.len()).sum();
    assert_eq!(
        22 + 16,
        bound + result.unscheduled_pods.len(),
        "16 extra deployment replicas over the fitting scenario"
    );
}

#[test]
fn test_rerun_with_identical_inputs_is_stable() {
    let _ = env_logger::try_init();

    let first = simulate(
        &tiny_cluster(),
        &[simple_app(4)],
        &SimulateOptions::default(),
    )
    .unwrap();
    let second = simulate(
        &tiny_cluster(),
        &[simple_app(4)],
        &SimulateOptions::default(),
    )
    .unwrap();

    let bindings = |result: &SimulateResult| -> BTreeMap<String, String> {
        result
            .node_status
            .iter()
            .flat_map(|status| {
                status
                    .pods
                    .iter()
                    .map(|pod| (pod.key(), status.node.metadata.name.clone()))
            })
            .collect()
    };
    assert_eq!(bindings(&first), bindings(&second));
    assert_eq!(
        first.unscheduled_pods.len(),
        second.unscheduled_pods.len()
    );
}
