//! In-memory, event-emitting mirror of the orchestrator API objects.
//!
//! The store offers the list/get/create/update/delete surface the scheduler
//! loop and the simulation driver consume, serializes mutations behind one
//! lock, and delivers pod add/update events synchronously to subscribed
//! handlers. A field filter restricts pod events to simulator-owned pods
//! (those carrying the default scheduler name), so only scheduler decisions
//! reach the driver's completion channel.

use std::collections::BTreeMap;
use std::sync::Mutex;

use log::debug;

use crate::core::cluster::ResourceTypes;
use crate::core::common::DEFAULT_SCHEDULER_NAME;
use crate::core::node::Node;
use crate::core::pod::Pod;
use crate::core::resources::RuntimeResources;
use crate::core::workload::{
    ConfigMap, CronJob, DaemonSet, Deployment, Job, PersistentVolumeClaim, PodDisruptionBudget,
    ReplicaSet, ReplicationController, Service, StatefulSet, StorageClass,
};
use crate::error::SimonError;

#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(Pod),
    Updated { old: Pod, new: Pod },
}

pub type PodEventHandler = Box<dyn Fn(&PodEvent) + Send + Sync>;

#[derive(Default)]
struct Objects {
    nodes: BTreeMap<String, Node>,
    /// keyed by `namespace/name`
    pods: BTreeMap<String, Pod>,
    services: BTreeMap<String, Service>,
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    storage_classes: BTreeMap<String, StorageClass>,
    pdbs: BTreeMap<String, PodDisruptionBudget>,
    config_maps: BTreeMap<String, ConfigMap>,
    deployments: BTreeMap<String, Deployment>,
    replica_sets: BTreeMap<String, ReplicaSet>,
    replication_controllers: BTreeMap<String, ReplicationController>,
    stateful_sets: BTreeMap<String, StatefulSet>,
    daemon_sets: BTreeMap<String, DaemonSet>,
    jobs: BTreeMap<String, Job>,
    cron_jobs: BTreeMap<String, CronJob>,
}

#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<Objects>,
    pod_handlers: Mutex<Vec<PodEventHandler>>,
}

fn namespaced_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn insert_unique<T>(
    map: &mut BTreeMap<String, T>,
    key: String,
    value: T,
    kind: &str,
) -> Result<(), SimonError> {
    if map.contains_key(&key) {
        return Err(SimonError::SeedConflict(format!(
            "{} {:?} already exists",
            kind, key
        )));
    }
    map.insert(key, value);
    Ok(())
}

impl FakeCluster {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a pod event handler. Events are delivered synchronously on
    /// the mutating thread, after the store lock is released, and only for
    /// pods owned by the default scheduler.
    pub fn subscribe_pods(&self, handler: PodEventHandler) {
        self.pod_handlers.lock().unwrap().push(handler);
    }

    fn emit(&self, event: PodEvent) {
        let owned = match &event {
            PodEvent::Added(pod) => pod.spec.scheduler_name == DEFAULT_SCHEDULER_NAME,
            PodEvent::Updated { new, .. } => new.spec.scheduler_name == DEFAULT_SCHEDULER_NAME,
        };
        if !owned {
            return;
        }
        for handler in self.pod_handlers.lock().unwrap().iter() {
            handler(&event);
        }
    }

    // ---- pods ----

    pub fn create_pod(&self, pod: Pod) -> Result<(), SimonError> {
        {
            let mut objects = self.objects.lock().unwrap();
            insert_unique(&mut objects.pods, pod.key(), pod.clone(), "pod")?;
        }
        self.emit(PodEvent::Added(pod));
        Ok(())
    }

    pub fn update_pod(&self, pod: Pod) -> Result<(), SimonError> {
        let old = {
            let mut objects = self.objects.lock().unwrap();
            match objects.pods.insert(pod.key(), pod.clone()) {
                Some(old) => old,
                None => {
                    objects.pods.remove(&pod.key());
                    return Err(SimonError::PluginInternal(format!(
                        "update of unknown pod {:?}",
                        pod.key()
                    )));
                }
            }
        };
        self.emit(PodEvent::Updated { old, new: pod });
        Ok(())
    }

    pub fn delete_pod(&self, key: &str) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        match objects.pods.remove(key) {
            Some(_) => Ok(()),
            None => Err(SimonError::PluginInternal(format!(
                "delete of unknown pod {:?}",
                key
            ))),
        }
    }

    pub fn get_pod(&self, key: &str) -> Option<Pod> {
        self.objects.lock().unwrap().pods.get(key).cloned()
    }

    pub fn list_pods(&self) -> Vec<Pod> {
        self.objects.lock().unwrap().pods.values().cloned().collect()
    }

    pub fn pods_on_node(&self, node_name: &str) -> Vec<Pod> {
        self.objects
            .lock()
            .unwrap()
            .pods
            .values()
            .filter(|p| p.spec.node_name == node_name)
            .cloned()
            .collect()
    }

    /// Sum of requested resources of all pods bound to the node.
    pub fn node_requested(&self, node_name: &str) -> RuntimeResources {
        let mut total = RuntimeResources::default();
        for pod in self.pods_on_node(node_name) {
            total.add(&pod.calculate_requested_resources());
        }
        total
    }

    /// Allocatable minus requested for the named node.
    pub fn node_available(&self, node_name: &str) -> Option<RuntimeResources> {
        let node = self.get_node(node_name)?;
        let mut available = node.status.allocatable;
        available.sub(&self.node_requested(node_name));
        Some(available)
    }

    // ---- nodes ----

    pub fn create_node(&self, node: Node) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        insert_unique(
            &mut objects.nodes,
            node.metadata.name.clone(),
            node,
            "node",
        )
    }

    pub fn update_node(&self, node: Node) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let name = node.metadata.name.clone();
        match objects.nodes.insert(name.clone(), node) {
            Some(_) => Ok(()),
            None => {
                objects.nodes.remove(&name);
                Err(SimonError::PluginInternal(format!(
                    "update of unknown node {:?}",
                    name
                )))
            }
        }
    }

    pub fn get_node(&self, name: &str) -> Option<Node> {
        self.objects.lock().unwrap().nodes.get(name).cloned()
    }

    /// All nodes, ordered by name.
    pub fn list_nodes(&self) -> Vec<Node> {
        self.objects
            .lock()
            .unwrap()
            .nodes
            .values()
            .cloned()
            .collect()
    }

    // ---- other kinds ----

    pub fn create_service(&self, object: Service) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.services, key, object, "service")
    }

    pub fn create_pvc(&self, object: PersistentVolumeClaim) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.pvcs, key, object, "pvc")
    }

    pub fn create_storage_class(&self, object: StorageClass) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = object.metadata.name.clone();
        insert_unique(&mut objects.storage_classes, key, object, "storage class")
    }

    pub fn get_storage_class(&self, name: &str) -> Option<StorageClass> {
        self.objects
            .lock()
            .unwrap()
            .storage_classes
            .get(name)
            .cloned()
    }

    pub fn create_pdb(&self, object: PodDisruptionBudget) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.pdbs, key, object, "pdb")
    }

    pub fn create_config_map(&self, object: ConfigMap) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.config_maps, key, object, "config map")
    }

    pub fn create_deployment(&self, object: Deployment) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.deployments, key, object, "deployment")
    }

    pub fn create_replica_set(&self, object: ReplicaSet) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.replica_sets, key, object, "replica set")
    }

    pub fn create_replication_controller(
        &self,
        object: ReplicationController,
    ) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(
            &mut objects.replication_controllers,
            key,
            object,
            "replication controller",
        )
    }

    pub fn create_stateful_set(&self, object: StatefulSet) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.stateful_sets, key, object, "stateful set")
    }

    pub fn create_daemon_set(&self, object: DaemonSet) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.daemon_sets, key, object, "daemon set")
    }

    pub fn create_job(&self, object: Job) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.jobs, key, object, "job")
    }

    pub fn create_cron_job(&self, object: CronJob) -> Result<(), SimonError> {
        let mut objects = self.objects.lock().unwrap();
        let key = namespaced_key(&object.metadata.namespace, &object.metadata.name);
        insert_unique(&mut objects.cron_jobs, key, object, "cron job")
    }

    /// Seeds every non-pod object of a cluster snapshot.
    pub fn seed_cluster_objects(&self, cluster: &ResourceTypes) -> Result<(), SimonError> {
        for item in &cluster.pod_disruption_budgets {
            self.create_pdb(item.clone())?;
        }
        for item in &cluster.services {
            self.create_service(item.clone())?;
        }
        for item in &cluster.storage_classes {
            self.create_storage_class(item.clone())?;
        }
        for item in &cluster.persistent_volume_claims {
            self.create_pvc(item.clone())?;
        }
        for item in &cluster.config_maps {
            self.create_config_map(item.clone())?;
        }
        for item in &cluster.deployments {
            self.create_deployment(item.clone())?;
        }
        for item in &cluster.replica_sets {
            self.create_replica_set(item.clone())?;
        }
        for item in &cluster.replication_controllers {
            self.create_replication_controller(item.clone())?;
        }
        for item in &cluster.stateful_sets {
            self.create_stateful_set(item.clone())?;
        }
        for item in &cluster.daemon_sets {
            self.create_daemon_set(item.clone())?;
        }
        for item in &cluster.jobs {
            self.create_job(item.clone())?;
        }
        for item in &cluster.cron_jobs {
            self.create_cron_job(item.clone())?;
        }
        debug!(
            "seeded fake cluster objects: {} services, {} daemon sets, {} deployments",
            cluster.services.len(),
            cluster.daemon_sets.len(),
            cluster.deployments.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::core::common::DEFAULT_SCHEDULER_NAME;

    fn simulator_pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = name.to_string();
        pod.metadata.namespace = "default".to_string();
        pod.spec.scheduler_name = DEFAULT_SCHEDULER_NAME.to_string();
        pod
    }

    #[test]
    fn test_create_pod_twice_is_a_seed_conflict() {
        let store = FakeCluster::new();
        store.create_pod(simulator_pod("a")).unwrap();
        assert!(matches!(
            store.create_pod(simulator_pod("a")),
            Err(SimonError::SeedConflict(_))
        ));
    }

    #[test]
    fn test_update_events_only_for_simulator_owned_pods() {
        let store = FakeCluster::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = seen.clone();
        store.subscribe_pods(Box::new(move |event| {
            if let PodEvent::Updated { .. } = event {
                seen_in_handler.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let mut foreign = simulator_pod("foreign");
        foreign.spec.scheduler_name = "other-scheduler".to_string();
        store.create_pod(foreign.clone()).unwrap();
        foreign.spec.node_name = "node-1".to_string();
        store.update_pod(foreign).unwrap();
        assert_eq!(0, seen.load(Ordering::SeqCst));

        let mut owned = simulator_pod("owned");
        store.create_pod(owned.clone()).unwrap();
        owned.spec.node_name = "node-1".to_string();
        store.update_pod(owned).unwrap();
        assert_eq!(1, seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_node_available_subtracts_bound_pods() {
        let store = FakeCluster::new();
        let mut node = Node::default();
        node.metadata.name = "node-1".to_string();
        node.status.allocatable.cpu = 8000;
        node.status.allocatable.memory = 16 << 30;
        store.create_node(node).unwrap();

        let mut pod = simulator_pod("bound");
        pod.spec.node_name = "node-1".to_string();
        pod.spec.containers.push(crate::core::pod::Container {
            resources: crate::core::pod::ResourceRequirements {
                requests: RuntimeResources {
                    cpu: 1500,
                    memory: 1 << 30,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        });
        store.create_pod(pod).unwrap();

        let available = store.node_available("node-1").unwrap();
        assert_eq!(6500, available.cpu);
        assert_eq!((16 << 30) - (1 << 30), available.memory);
    }
}
