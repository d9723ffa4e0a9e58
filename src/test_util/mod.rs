//! Builders for fake cluster objects, used by the integration tests.

use std::collections::BTreeMap;

use crate::core::common::{ObjectMeta, DEFAULT_SCHEDULER_NAME};
use crate::core::node::{Node, NodeStorage, Taint};
use crate::core::pod::{
    Affinity, Container, Pod, ResourceRequirements, Toleration, VolumeRequest,
};
use crate::core::resources::{parse_bytes, parse_cpu_milli, Quantity, RuntimeResources};
use crate::core::workload::{
    DaemonSet, Deployment, Job, PodTemplateSpec, ReplicaSet, StatefulSet,
};

pub type FakeNodeOption = Box<dyn FnOnce(&mut Node)>;
pub type FakePodOption = Box<dyn FnOnce(&mut Pod)>;
pub type FakeDeploymentOption = Box<dyn FnOnce(&mut Deployment)>;
pub type FakeDaemonSetOption = Box<dyn FnOnce(&mut DaemonSet)>;
pub type FakeStatefulSetOption = Box<dyn FnOnce(&mut StatefulSet)>;
pub type FakeReplicaSetOption = Box<dyn FnOnce(&mut ReplicaSet)>;

fn quantity_resources(cpu: &str, memory: &str) -> RuntimeResources {
    let mut resources = RuntimeResources::default();
    if !cpu.is_empty() {
        resources.cpu = parse_cpu_milli(&Quantity::Str(cpu.to_string())).expect("valid cpu");
    }
    if !memory.is_empty() {
        resources.memory =
            parse_bytes(&Quantity::Str(memory.to_string())).expect("valid memory");
    }
    resources
}

fn request_template(cpu: &str, memory: &str) -> PodTemplateSpec {
    let mut template = PodTemplateSpec::default();
    template.spec.containers.push(Container {
        name: "container".to_string(),
        image: "nginx".to_string(),
        resources: ResourceRequirements {
            requests: quantity_resources(cpu, memory),
            ..Default::default()
        },
    });
    template
}

pub fn make_fake_node(
    name: &str,
    cpu: &str,
    memory: &str,
    opts: Vec<FakeNodeOption>,
) -> Node {
    let mut node = Node {
        metadata: ObjectMeta::named(name, ""),
        ..Default::default()
    };
    node.status.capacity = quantity_resources(cpu, memory);
    node.status.allocatable = node.status.capacity;
    for opt in opts {
        opt(&mut node);
    }
    node
}

pub fn with_node_labels(labels: &[(&str, &str)]) -> FakeNodeOption {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Box::new(move |node| node.metadata.labels.extend(labels))
}

pub fn with_node_taints(taints: Vec<Taint>) -> FakeNodeOption {
    Box::new(move |node| node.spec.taints = taints)
}

pub fn with_node_local_storage(storage: NodeStorage) -> FakeNodeOption {
    Box::new(move |node| node.set_local_storage(&storage))
}

/// GPU capacity: `count` devices with `memory_per_gpu` bytes each.
pub fn with_node_gpus(count: i64, memory_per_gpu: i64) -> FakeNodeOption {
    Box::new(move |node| {
        node.status.capacity.gpu_count = count;
        node.status.capacity.gpu_memory = count * memory_per_gpu;
        node.status.allocatable.gpu_count = count;
        node.status.allocatable.gpu_memory = count * memory_per_gpu;
    })
}

pub fn make_fake_pod(
    name: &str,
    namespace: &str,
    cpu: &str,
    memory: &str,
    opts: Vec<FakePodOption>,
) -> Pod {
    let mut pod = Pod {
        metadata: ObjectMeta::named(name, namespace),
        ..Default::default()
    };
    pod.spec.scheduler_name = DEFAULT_SCHEDULER_NAME.to_string();
    pod.spec.containers.push(Container {
        name: "container".to_string(),
        image: "nginx".to_string(),
        resources: ResourceRequirements {
            requests: quantity_resources(cpu, memory),
            ..Default::default()
        },
    });
    for opt in opts {
        opt(&mut pod);
    }
    pod
}

pub fn with_pod_node_name(node_name: &str) -> FakePodOption {
    let node_name = node_name.to_string();
    Box::new(move |pod| pod.spec.node_name = node_name)
}

pub fn with_pod_node_selector(selector: &[(&str, &str)]) -> FakePodOption {
    let selector: BTreeMap<String, String> = selector
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Box::new(move |pod| pod.spec.node_selector = selector)
}

pub fn with_pod_tolerations(tolerations: Vec<Toleration>) -> FakePodOption {
    Box::new(move |pod| pod.spec.tolerations = tolerations)
}

pub fn with_pod_affinity(affinity: Affinity) -> FakePodOption {
    Box::new(move |pod| pod.spec.affinity = Some(affinity))
}

pub fn with_pod_labels(labels: &[(&str, &str)]) -> FakePodOption {
    let labels: BTreeMap<String, String> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Box::new(move |pod| pod.metadata.labels.extend(labels))
}

/// Fractional-GPU request: `memory_per_gpu` bytes on each of `count` GPUs,
/// declared as container limits the way the GPU-share convention expects.
pub fn with_pod_gpu(memory_per_gpu: i64, count: i64) -> FakePodOption {
    Box::new(move |pod| {
        let container = pod.spec.containers.first_mut().expect("builder container");
        container.resources.limits.gpu_memory = memory_per_gpu;
        container.resources.limits.gpu_count = count;
    })
}

pub fn make_fake_deployment(
    name: &str,
    namespace: &str,
    replicas: i32,
    cpu: &str,
    memory: &str,
    opts: Vec<FakeDeploymentOption>,
) -> Deployment {
    let mut deployment = Deployment {
        metadata: ObjectMeta::named(name, namespace),
        ..Default::default()
    };
    deployment.spec.replicas = Some(replicas);
    deployment.spec.template = request_template(cpu, memory);
    deployment
        .spec
        .template
        .metadata
        .set_label("app", name);
    for opt in opts {
        opt(&mut deployment);
    }
    deployment
}

pub fn with_deployment_tolerations(tolerations: Vec<Toleration>) -> FakeDeploymentOption {
    Box::new(move |deployment| deployment.spec.template.spec.tolerations = tolerations)
}

pub fn with_deployment_affinity(affinity: Affinity) -> FakeDeploymentOption {
    Box::new(move |deployment| deployment.spec.template.spec.affinity = Some(affinity))
}

pub fn make_fake_replica_set(
    name: &str,
    namespace: &str,
    replicas: i32,
    cpu: &str,
    memory: &str,
    opts: Vec<FakeReplicaSetOption>,
) -> ReplicaSet {
    let mut replica_set = ReplicaSet {
        metadata: ObjectMeta::named(name, namespace),
        ..Default::default()
    };
    replica_set.spec.replicas = Some(replicas);
    replica_set.spec.template = request_template(cpu, memory);
    for opt in opts {
        opt(&mut replica_set);
    }
    replica_set
}

pub fn with_replica_set_tolerations(tolerations: Vec<Toleration>) -> FakeReplicaSetOption {
    Box::new(move |replica_set| replica_set.spec.template.spec.tolerations = tolerations)
}

pub fn make_fake_daemon_set(
    name: &str,
    namespace: &str,
    cpu: &str,
    memory: &str,
    opts: Vec<FakeDaemonSetOption>,
) -> DaemonSet {
    let mut daemon_set = DaemonSet {
        metadata: ObjectMeta::named(name, namespace),
        ..Default::default()
    };
    daemon_set.spec.template = request_template(cpu, memory);
    for opt in opts {
        opt(&mut daemon_set);
    }
    daemon_set
}

pub fn with_daemon_set_tolerations(tolerations: Vec<Toleration>) -> FakeDaemonSetOption {
    Box::new(move |daemon_set| daemon_set.spec.template.spec.tolerations = tolerations)
}

pub fn with_daemon_set_node_selector(selector: &[(&str, &str)]) -> FakeDaemonSetOption {
    let selector: BTreeMap<String, String> = selector
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Box::new(move |daemon_set| daemon_set.spec.template.spec.node_selector = selector)
}

pub fn with_daemon_set_affinity(affinity: Affinity) -> FakeDaemonSetOption {
    Box::new(move |daemon_set| daemon_set.spec.template.spec.affinity = Some(affinity))
}

pub fn make_fake_stateful_set(
    name: &str,
    namespace: &str,
    replicas: i32,
    cpu: &str,
    memory: &str,
    opts: Vec<FakeStatefulSetOption>,
) -> StatefulSet {
    let mut stateful_set = StatefulSet {
        metadata: ObjectMeta::named(name, namespace),
        ..Default::default()
    };
    stateful_set.spec.replicas = Some(replicas);
    stateful_set.spec.template = request_template(cpu, memory);
    stateful_set
        .spec
        .template
        .metadata
        .set_label("app", name);
    for opt in opts {
        opt(&mut stateful_set);
    }
    stateful_set
}

pub fn with_stateful_set_tolerations(tolerations: Vec<Toleration>) -> FakeStatefulSetOption {
    Box::new(move |stateful_set| stateful_set.spec.template.spec.tolerations = tolerations)
}

pub fn with_stateful_set_affinity(affinity: Affinity) -> FakeStatefulSetOption {
    Box::new(move |stateful_set| stateful_set.spec.template.spec.affinity = Some(affinity))
}

/// Attaches a pod-side local storage request to the template, the way the
/// stateful-set storage expansion would.
pub fn with_stateful_set_local_storage(request: VolumeRequest) -> FakeStatefulSetOption {
    Box::new(move |stateful_set| {
        let data = serde_json::to_string(&request).expect("volume request serializes");
        stateful_set
            .spec
            .template
            .metadata
            .set_annotation(crate::core::common::ANNO_POD_LOCAL_STORAGE, &data);
    })
}

pub fn make_fake_job(
    name: &str,
    namespace: &str,
    completions: i32,
    cpu: &str,
    memory: &str,
) -> Job {
    let mut job = Job {
        metadata: ObjectMeta::named(name, namespace),
        ..Default::default()
    };
    job.spec.completions = Some(completions);
    job.spec.template = request_template(cpu, memory);
    job
}
