use std::collections::BTreeSet;

use simon::core::cluster::{AppResource, ResourceTypes};
use simon::simulator::{simulate, SimulateOptions};
use simon::test_util::*;

const GIB: i64 = 1 << 30;

fn gpu_cluster(node_names: &[&str]) -> ResourceTypes {
    let mut cluster = ResourceTypes::default();
    for name in node_names {
        cluster.nodes.push(make_fake_node(
            name,
            "8",
            "16Gi",
            vec![with_node_gpus(4, 16 * GIB)],
        ));
    }
    cluster
}

fn gpu_app(pod_count: usize, memory_per_gpu: i64, gpu_count: i64) -> AppResource {
    let mut resource = ResourceTypes::default();
    for index in 0..pod_count {
        resource.pods.push(make_fake_pod(
            &format!("cuda-{}", index),
            "default",
            "100m",
            "100Mi",
            vec![with_pod_gpu(memory_per_gpu, gpu_count)],
        ));
    }
    AppResource {
        name: "gpu".to_string(),
        resource,
    }
}

#[test]
fn test_gpu_packing_on_distinct_devices() {
    let _ = env_logger::try_init();

    let cluster = gpu_cluster(&["gpu-a", "gpu-b"]);
    let apps = vec![gpu_app(4, 12 * GIB, 1)];
    let result = simulate(&cluster, &apps, &SimulateOptions::default()).unwrap();

    assert!(
        result.unscheduled_pods.is_empty(),
        "failures: {:?}",
        result
            .unscheduled_pods
            .iter()
            .map(|p| p.reason.clone())
            .collect::<Vec<_>>()
    );

    // each pod occupies one device; 12GiB of 16GiB means no device can be
    // shared, so the (node, device) pairs are pairwise distinct
    let mut occupied: BTreeSet<(String, usize)> = BTreeSet::new();
    let mut gpu_pods = 0;
    for status in &result.node_status {
        for pod in &status.pods {
            let indices = pod.gpu_index_list();
            gpu_pods += 1;
            assert_eq!(1, indices.len(), "pod {} got {:?}", pod.key(), indices);
            let annotation = pod.gpu_index_annotation().unwrap();
            assert_eq!(1, annotation.len(), "single digit expected");
            assert!(
                occupied.insert((status.node.metadata.name.clone(), indices[0])),
                "device shared: {:?}/{}",
                status.node.metadata.name,
                indices[0]
            );
        }
    }
    assert_eq!(4, gpu_pods);
}

#[test]
fn test_multi_gpu_pod_consumes_lowest_indices() {
    let _ = env_logger::try_init();

    let cluster = gpu_cluster(&["gpu-a"]);
    let apps = vec![gpu_app(1, 10 * GIB, 3)];
    let result = simulate(&cluster, &apps, &SimulateOptions::default()).unwrap();

    assert!(result.unscheduled_pods.is_empty());
    let pod = result
        .node_status
        .iter()
        .flat_map(|s| s.pods.iter())
        .next()
        .unwrap();
    assert_eq!(Some(&"0-1-2".to_string()), pod.gpu_index_annotation());
}

#[test]
fn test_gpu_demand_beyond_capacity_is_rejected() {
    let _ = env_logger::try_init();

    // nine 12-of-16 GiB slices onto eight devices: exactly one pod fails
    let cluster = gpu_cluster(&["gpu-a", "gpu-b"]);
    let apps = vec![gpu_app(9, 12 * GIB, 1)];
    let result = simulate(&cluster, &apps, &SimulateOptions::default()).unwrap();

    assert_eq!(1, result.unscheduled_pods.len());
    let bound: usize = result.node_status.iter().map(|s| s.pods.len()).sum();
    assert_eq!(8, bound);
}
