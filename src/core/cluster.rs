//! Aggregates describing a cluster snapshot and an application awaiting
//! deployment. Both are immutable inputs to the simulation.

use serde::{Deserialize, Serialize};

use crate::core::node::Node;
use crate::core::pod::Pod;
use crate::core::workload::{
    ConfigMap, CronJob, DaemonSet, Deployment, Job, PersistentVolumeClaim, PodDisruptionBudget,
    ReplicaSet, ReplicationController, Service, StatefulSet, StorageClass,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceTypes {
    pub nodes: Vec<Node>,
    pub pods: Vec<Pod>,
    pub daemon_sets: Vec<DaemonSet>,
    pub stateful_sets: Vec<StatefulSet>,
    pub deployments: Vec<Deployment>,
    pub replica_sets: Vec<ReplicaSet>,
    pub replication_controllers: Vec<ReplicationController>,
    pub jobs: Vec<Job>,
    pub cron_jobs: Vec<CronJob>,
    pub services: Vec<Service>,
    pub persistent_volume_claims: Vec<PersistentVolumeClaim>,
    pub storage_classes: Vec<StorageClass>,
    pub pod_disruption_budgets: Vec<PodDisruptionBudget>,
    pub config_maps: Vec<ConfigMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppResource {
    pub name: String,
    pub resource: ResourceTypes,
}
