//! Expansion of workload templates into concrete pod specs, pod and node
//! normalization, and the daemon-set-per-node materialization.
//!
//! Generated names embed short hex hashes drawn from a seeded generator, so
//! identical inputs with the same seed expand to identical names. Expansion
//! of large inputs fans out: chunks of at most 100 pods per worker for the
//! pod list, one worker per workload kind for the templates, all joined
//! through an indexed aggregator with a shared error sink.

use std::collections::BTreeMap;
use std::sync::mpsc::channel;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::core::cluster::ResourceTypes;
use crate::core::common::{
    ObjectMeta, OwnerReference, ANNO_POD_LOCAL_STORAGE, ANNO_POD_PROVISIONER,
    ANNO_WORKLOAD_KIND, ANNO_WORKLOAD_NAME, ANNO_WORKLOAD_NAMESPACE, DEFAULT_SCHEDULER_NAME,
    KIND_CRON_JOB, KIND_DAEMON_SET, KIND_DEPLOYMENT, KIND_JOB, KIND_REPLICATION_CONTROLLER,
    KIND_REPLICA_SET, KIND_STATEFUL_SET, LABEL_HOSTNAME, NAMESPACE_DEFAULT, SC_NAME_DEVICE_HDD,
    SC_NAME_DEVICE_SSD, SC_NAME_LVM, SC_NAME_YODA_DEVICE_HDD, SC_NAME_YODA_DEVICE_SSD,
    SC_NAME_YODA_LVM,
};
use crate::core::matching::node_should_run_pod;
use crate::core::node::Node;
use crate::core::pod::{
    HostPathVolumeSource, Pod, VolumeClaim, VolumeKind, VolumeRequest,
};
use crate::core::workload::{
    CronJob, DaemonSet, Deployment, Job, PodTemplateSpec, ReplicaSet, ReplicationController,
    StatefulSet,
};
use crate::error::SimonError;

const POD_CHUNK_SIZE: usize = 100;

const DNS_POLICY_DEFAULT: &str = "ClusterFirst";
const RESTART_POLICY_DEFAULT: &str = "Always";

/// Seeded source of the short name hashes carried by generated pods
/// (5 hex chars) and generated intermediate workloads (10 hex chars).
pub struct NameSalt {
    rng: StdRng,
}

impl NameSalt {
    pub fn from_seed(seed: u64) -> Self {
        NameSalt {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Derives an independent generator, so per-kind expansion workers stay
    /// deterministic regardless of scheduling order.
    pub fn fork(&mut self) -> NameSalt {
        NameSalt::from_seed(self.rng.gen())
    }

    fn hash(&mut self, chars: usize) -> String {
        let value: u64 = self.rng.gen();
        format!("{:016x}", value)[..chars].to_string()
    }

    pub fn short5(&mut self) -> String {
        self.hash(5)
    }

    pub fn short10(&mut self) -> String {
        self.hash(10)
    }
}

fn validate_pod(pod: &Pod) -> Result<(), SimonError> {
    if pod.metadata.name.is_empty() {
        return Err(SimonError::InvalidInput("invalid pod: empty name".to_string()));
    }
    for container in &pod.spec.containers {
        let requests = &container.resources.requests;
        let limits = &container.resources.limits;
        if requests.has_negative() || limits.has_negative() {
            return Err(SimonError::InvalidInput(format!(
                "invalid pod {}: negative resource quantity",
                pod.key()
            )));
        }
        for (kind, requested) in requests.iter() {
            let limit = limits.get(kind);
            if limit > 0 && requested > limit {
                return Err(SimonError::InvalidInput(format!(
                    "invalid pod {}: {} request exceeds limit",
                    pod.key(),
                    kind
                )));
            }
        }
    }
    Ok(())
}

/// Applies the defaults the simulator relies on, strips what it cannot
/// model, assigns a fresh uid and validates the result.
pub fn make_valid_pod(pod: &Pod) -> Result<Pod, SimonError> {
    let mut new_pod = pod.clone();
    if new_pod.metadata.namespace.is_empty() {
        new_pod.metadata.namespace = NAMESPACE_DEFAULT.to_string();
    }
    if new_pod.spec.dns_policy.is_empty() {
        new_pod.spec.dns_policy = DNS_POLICY_DEFAULT.to_string();
    }
    if new_pod.spec.restart_policy.is_empty() {
        new_pod.spec.restart_policy = RESTART_POLICY_DEFAULT.to_string();
    }
    if new_pod.spec.scheduler_name.is_empty() {
        new_pod.spec.scheduler_name = DEFAULT_SCHEDULER_NAME.to_string();
    }
    new_pod.metadata.uid = Uuid::new_v4().to_string();
    new_pod
        .metadata
        .set_annotation(ANNO_POD_PROVISIONER, DEFAULT_SCHEDULER_NAME);
    // real storage binding is out of scope; claims are modeled through the
    // pod storage annotation instead
    for volume in new_pod.spec.volumes.iter_mut() {
        if let Some(claim) = volume.persistent_volume_claim.take() {
            volume.host_path = Some(HostPathVolumeSource {
                path: format!("/mnt/simon/{}", claim.claim_name),
            });
        }
    }
    validate_pod(&new_pod)?;
    Ok(new_pod)
}

/// Hostname label, fresh uid, allocatable defaulted from capacity.
pub fn make_valid_node(node: &Node) -> Result<Node, SimonError> {
    if node.metadata.name.is_empty() {
        return Err(SimonError::InvalidInput("invalid node: empty name".to_string()));
    }
    let mut new_node = node.clone();
    let name = new_node.metadata.name.clone();
    new_node.metadata.set_label(LABEL_HOSTNAME, &name);
    new_node.metadata.uid = Uuid::new_v4().to_string();
    if new_node.status.allocatable.is_zero() {
        new_node.status.allocatable = new_node.status.capacity;
    }
    if new_node.status.allocatable.has_negative() || new_node.status.capacity.has_negative() {
        return Err(SimonError::InvalidInput(format!(
            "invalid node {}: negative resource quantity",
            name
        )));
    }
    Ok(new_node)
}

fn add_workload_info(pod: &mut Pod, kind: &str, name: &str, namespace: &str) {
    pod.metadata.set_annotation(ANNO_WORKLOAD_KIND, kind);
    pod.metadata.set_annotation(ANNO_WORKLOAD_NAME, name);
    pod.metadata.set_annotation(ANNO_WORKLOAD_NAMESPACE, namespace);
}

fn pod_from_template(
    template: &PodTemplateSpec,
    workload_meta: &ObjectMeta,
    pod_name: String,
    owner: OwnerReference,
    workload_kind: &str,
) -> Result<Pod, SimonError> {
    let mut pod = Pod {
        metadata: template.metadata.clone(),
        spec: template.spec.clone(),
        status: Default::default(),
    };
    pod.metadata.name = pod_name;
    pod.metadata.namespace = workload_meta.namespace.clone();
    pod.metadata.owner_references = vec![owner];
    let mut pod = make_valid_pod(&pod)?;
    let namespace = pod.metadata.namespace.clone();
    add_workload_info(&mut pod, workload_kind, &workload_meta.name, &namespace);
    Ok(pod)
}

pub fn pods_from_deployments(
    deployments: &[Deployment],
    salt: &mut NameSalt,
) -> Result<Vec<Pod>, SimonError> {
    let mut pods = vec![];
    for deploy in deployments {
        let replicas = deploy.spec.replicas.unwrap_or(1);
        let replica_set_name = format!("{}-{}", deploy.metadata.name, salt.short10());
        for _ in 0..replicas {
            let pod_name = format!("{}-{}", replica_set_name, salt.short5());
            pods.push(pod_from_template(
                &deploy.spec.template,
                &deploy.metadata,
                pod_name,
                OwnerReference::new(KIND_REPLICA_SET, &replica_set_name),
                KIND_DEPLOYMENT,
            )?);
        }
    }
    Ok(pods)
}

pub fn pods_from_replica_sets(
    replica_sets: &[ReplicaSet],
    salt: &mut NameSalt,
) -> Result<Vec<Pod>, SimonError> {
    let mut pods = vec![];
    for replica_set in replica_sets {
        let replicas = replica_set.spec.replicas.unwrap_or(1);
        for _ in 0..replicas {
            let pod_name = format!("{}-{}", replica_set.metadata.name, salt.short5());
            pods.push(pod_from_template(
                &replica_set.spec.template,
                &replica_set.metadata,
                pod_name,
                OwnerReference::new(KIND_REPLICA_SET, &replica_set.metadata.name),
                KIND_REPLICA_SET,
            )?);
        }
    }
    Ok(pods)
}

pub fn pods_from_replication_controllers(
    controllers: &[ReplicationController],
    salt: &mut NameSalt,
) -> Result<Vec<Pod>, SimonError> {
    let mut pods = vec![];
    for controller in controllers {
        let replicas = controller.spec.replicas.unwrap_or(1);
        for _ in 0..replicas {
            let pod_name = format!("{}-{}", controller.metadata.name, salt.short5());
            pods.push(pod_from_template(
                &controller.spec.template,
                &controller.metadata,
                pod_name,
                OwnerReference::new(KIND_REPLICATION_CONTROLLER, &controller.metadata.name),
                KIND_REPLICATION_CONTROLLER,
            )?);
        }
    }
    Ok(pods)
}

pub fn classify_storage_class(name: &str) -> Option<VolumeKind> {
    match name {
        SC_NAME_LVM | SC_NAME_YODA_LVM => Some(VolumeKind::Lvm),
        SC_NAME_DEVICE_SSD | SC_NAME_YODA_DEVICE_SSD => Some(VolumeKind::Ssd),
        SC_NAME_DEVICE_HDD | SC_NAME_YODA_DEVICE_HDD => Some(VolumeKind::Hdd),
        _ if name.contains("lvm") => Some(VolumeKind::Lvm),
        _ => None,
    }
}

/// Classifies the volume-claim templates by storage class and aggregates
/// them into the storage annotation the local-storage plugin consumes.
pub fn expand_stateful_set_storage(stateful_set: &StatefulSet) -> Option<VolumeRequest> {
    let mut volumes = vec![];
    for template in &stateful_set.spec.volume_claim_templates {
        let storage_class = match &template.spec.storage_class_name {
            Some(storage_class) => storage_class.clone(),
            None => continue,
        };
        match classify_storage_class(&storage_class) {
            Some(kind) => volumes.push(VolumeClaim {
                kind,
                size: template.storage_bytes(),
                storage_class,
            }),
            None => debug!(
                "stateful set {}: storage class {:?} is not local, skipping",
                stateful_set.metadata.name, storage_class
            ),
        }
    }
    if volumes.is_empty() {
        None
    } else {
        Some(VolumeRequest { volumes })
    }
}

pub fn pods_from_stateful_sets(
    stateful_sets: &[StatefulSet],
    _salt: &mut NameSalt,
) -> Result<Vec<Pod>, SimonError> {
    let mut pods = vec![];
    for stateful_set in stateful_sets {
        let replicas = stateful_set.spec.replicas.unwrap_or(1);
        let storage = expand_stateful_set_storage(stateful_set);
        for ordinal in 0..replicas {
            let pod_name = format!("{}-{}", stateful_set.metadata.name, ordinal);
            let mut pod = pod_from_template(
                &stateful_set.spec.template,
                &stateful_set.metadata,
                pod_name,
                OwnerReference::new(KIND_STATEFUL_SET, &stateful_set.metadata.name),
                KIND_STATEFUL_SET,
            )?;
            if let Some(request) = &storage {
                let data = serde_json::to_string(request)?;
                pod.metadata.set_annotation(ANNO_POD_LOCAL_STORAGE, &data);
            }
            pods.push(pod);
        }
    }
    Ok(pods)
}

pub fn pods_from_jobs(jobs: &[Job], salt: &mut NameSalt) -> Result<Vec<Pod>, SimonError> {
    let mut pods = vec![];
    for job in jobs {
        let completions = job.spec.completions.or(job.spec.parallelism).unwrap_or(1);
        for _ in 0..completions {
            let pod_name = format!("{}-{}", job.metadata.name, salt.short5());
            pods.push(pod_from_template(
                &job.spec.template,
                &job.metadata,
                pod_name,
                OwnerReference::new(KIND_JOB, &job.metadata.name),
                KIND_JOB,
            )?);
        }
    }
    Ok(pods)
}

pub fn pods_from_cron_jobs(
    cron_jobs: &[CronJob],
    salt: &mut NameSalt,
) -> Result<Vec<Pod>, SimonError> {
    let mut pods = vec![];
    for cron_job in cron_jobs {
        let job_spec = &cron_job.spec.job_template.spec;
        let completions = job_spec.completions.or(job_spec.parallelism).unwrap_or(1);
        let job_name = format!("{}-{}", cron_job.metadata.name, salt.short10());
        for _ in 0..completions {
            let pod_name = format!("{}-{}", job_name, salt.short5());
            let mut pod = pod_from_template(
                &job_spec.template,
                &cron_job.metadata,
                pod_name,
                OwnerReference::new(KIND_JOB, &job_name),
                KIND_CRON_JOB,
            )?;
            // cron pods keep the generated job as owner but trace back to
            // the cron job through the workload annotations
            add_workload_info(
                &mut pod,
                KIND_CRON_JOB,
                &cron_job.metadata.name,
                &cron_job.metadata.namespace,
            );
            pods.push(pod);
        }
    }
    Ok(pods)
}

/// A daemon-set template is instantiated once per node passing the
/// daemon-set predicate, pre-bound to that node.
pub fn pods_from_daemon_sets(
    daemon_sets: &[DaemonSet],
    nodes: &[Node],
    salt: &mut NameSalt,
) -> Result<Vec<Pod>, SimonError> {
    let mut pods = vec![];
    for daemon_set in daemon_sets {
        for node in nodes {
            let pod_name = format!("{}-{}", daemon_set.metadata.name, salt.short5());
            let mut pod = pod_from_template(
                &daemon_set.spec.template,
                &daemon_set.metadata,
                pod_name,
                OwnerReference::new(KIND_DAEMON_SET, &daemon_set.metadata.name),
                KIND_DAEMON_SET,
            )?;
            pod.spec.node_name = node.metadata.name.clone();
            if node_should_run_pod(node, &pod) {
                pods.push(pod);
            }
        }
    }
    Ok(pods)
}

/// Normalizes a pod list, fanning chunks of at most 100 pods out to scoped
/// workers. Chunk results are merged by index, the first error wins.
pub fn normalize_pods(pods: &[Pod]) -> Result<Vec<Pod>, SimonError> {
    if pods.len() <= POD_CHUNK_SIZE {
        return pods.iter().map(make_valid_pod).collect();
    }
    std::thread::scope(|scope| {
        let (tx, rx) = channel();
        for (index, chunk) in pods.chunks(POD_CHUNK_SIZE).enumerate() {
            let tx = tx.clone();
            scope.spawn(move || {
                let result: Result<Vec<Pod>, SimonError> =
                    chunk.iter().map(make_valid_pod).collect();
                let _ = tx.send((index, result));
            });
        }
        drop(tx);
        let mut chunks: BTreeMap<usize, Vec<Pod>> = BTreeMap::new();
        let mut first_error = None;
        for (index, result) in rx {
            match result {
                Ok(pods) => {
                    chunks.insert(index, pods);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(chunks.into_values().flatten().collect()),
        }
    })
}

/// Materializes every workload of `resource` into pods: standalone pods are
/// normalized, templates emit their replicas, daemon sets expand over
/// `nodes`. One scoped worker per workload kind, merged deterministically.
pub fn expand_workloads(
    resource: &ResourceTypes,
    nodes: &[Node],
    salt: &mut NameSalt,
) -> Result<Vec<Pod>, SimonError> {
    let mut deploy_salt = salt.fork();
    let mut replica_set_salt = salt.fork();
    let mut controller_salt = salt.fork();
    let mut stateful_set_salt = salt.fork();
    let mut job_salt = salt.fork();
    let mut cron_job_salt = salt.fork();
    let mut daemon_set_salt = salt.fork();

    std::thread::scope(|scope| {
        let (tx, rx) = channel();
        macro_rules! worker {
            ($index:expr, $body:expr) => {{
                let tx = tx.clone();
                scope.spawn(move || {
                    let _ = tx.send(($index as usize, $body));
                });
            }};
        }
        worker!(0, normalize_pods(&resource.pods));
        worker!(1, pods_from_deployments(&resource.deployments, &mut deploy_salt));
        worker!(2, pods_from_replica_sets(&resource.replica_sets, &mut replica_set_salt));
        worker!(
            3,
            pods_from_replication_controllers(
                &resource.replication_controllers,
                &mut controller_salt
            )
        );
        worker!(
            4,
            pods_from_stateful_sets(&resource.stateful_sets, &mut stateful_set_salt)
        );
        worker!(5, pods_from_jobs(&resource.jobs, &mut job_salt));
        worker!(6, pods_from_cron_jobs(&resource.cron_jobs, &mut cron_job_salt));
        worker!(
            7,
            pods_from_daemon_sets(&resource.daemon_sets, nodes, &mut daemon_set_salt)
        );
        drop(tx);

        let mut groups: BTreeMap<usize, Vec<Pod>> = BTreeMap::new();
        let mut first_error = None;
        for (index, result) in rx {
            match result {
                Ok(pods) => {
                    groups.insert(index, pods);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(groups.into_values().flatten().collect()),
        }
    })
}
