//! Object metadata shared by every API object plus the well-known label,
//! annotation and name constants the simulator reads and writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SCHEDULER_NAME: &str = "default-scheduler";
pub const NAMESPACE_DEFAULT: &str = "default";
pub const NAMESPACE_SYSTEM: &str = "kube-system";

pub const SIMON_PLUGIN_NAME: &str = "Simon";
pub const OPEN_LOCAL_PLUGIN_NAME: &str = "Open-Local";
pub const OPEN_GPU_SHARE_PLUGIN_NAME: &str = "Open-Gpu-Share";

/// Name prefix of synthetic nodes appended by the capacity search.
pub const NEW_NODE_NAME_PREFIX: &str = "simon";

pub const ANNO_WORKLOAD_KIND: &str = "simon/workload-kind";
pub const ANNO_WORKLOAD_NAME: &str = "simon/workload-name";
pub const ANNO_WORKLOAD_NAMESPACE: &str = "simon/workload-namespace";
pub const ANNO_NODE_LOCAL_STORAGE: &str = "simon/node-local-storage";
pub const ANNO_POD_LOCAL_STORAGE: &str = "simon/pod-local-storage";
pub const ANNO_NODE_GPU_SHARE: &str = "simon/node-gpu-share";
pub const ANNO_GPU_INDEX: &str = "simon/gpu-index";
pub const ANNO_POD_PROVISIONER: &str = "simon/pod-provisioner";
pub const ANNO_ORIGINATED_FROM: &str = "originated-from";

pub const ANNO_CONFIG_MIRROR: &str = "kubernetes.io/config.mirror";
pub const ANNO_CONFIG_SOURCE: &str = "kubernetes.io/config.source";
pub const CONFIG_SOURCE_API: &str = "api";

pub const LABEL_NEW_NODE: &str = "simon/new-node";
pub const LABEL_APP_NAME: &str = "simon/app-name";
pub const LABEL_NON_REMOVABLE: &str = "simon/non-removable";
pub const LABEL_MASTER_ROLE: &str = "node-role.kubernetes.io/master";
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

pub const TAINT_UNSCHEDULABLE: &str = "node.kubernetes.io/unschedulable";
pub const TAINT_EFFECT_NO_SCHEDULE: &str = "NoSchedule";
pub const TAINT_EFFECT_NO_EXECUTE: &str = "NoExecute";
pub const TAINT_EFFECT_PREFER_NO_SCHEDULE: &str = "PreferNoSchedule";

pub const ENV_MAX_CPU: &str = "MaxCPU";
pub const ENV_MAX_MEMORY: &str = "MaxMemory";
pub const ENV_MAX_VG: &str = "MaxVG";
pub const ENV_LOG_LEVEL: &str = "LogLevel";

pub const KIND_POD: &str = "Pod";
pub const KIND_NODE: &str = "Node";
pub const KIND_DEPLOYMENT: &str = "Deployment";
pub const KIND_REPLICA_SET: &str = "ReplicaSet";
pub const KIND_REPLICATION_CONTROLLER: &str = "ReplicationController";
pub const KIND_STATEFUL_SET: &str = "StatefulSet";
pub const KIND_DAEMON_SET: &str = "DaemonSet";
pub const KIND_JOB: &str = "Job";
pub const KIND_CRON_JOB: &str = "CronJob";
pub const KIND_SERVICE: &str = "Service";
pub const KIND_PVC: &str = "PersistentVolumeClaim";
pub const KIND_STORAGE_CLASS: &str = "StorageClass";
pub const KIND_PDB: &str = "PodDisruptionBudget";
pub const KIND_CONFIG_MAP: &str = "ConfigMap";

/// Name and namespace of the placement config map written after `apply`.
pub const CONFIG_MAP_NAME: &str = "simon-scheduler-plan";
pub const CONFIG_MAP_FILE_NAME: &str = "configmap-simon.yaml";

// open-local compatible storage class names
pub const SC_NAME_LVM: &str = "open-local-lvm";
pub const SC_NAME_DEVICE_HDD: &str = "open-local-device-hdd";
pub const SC_NAME_DEVICE_SSD: &str = "open-local-device-ssd";
pub const SC_NAME_YODA_LVM: &str = "yoda-lvm-default";
pub const SC_NAME_YODA_DEVICE_HDD: &str = "yoda-device-hdd";
pub const SC_NAME_YODA_DEVICE_SSD: &str = "yoda-device-ssd";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn named(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.annotations.insert(key.to_string(), value.to_string());
    }

    pub fn has_label(&self, key: &str) -> bool {
        self.labels.contains_key(key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

impl OwnerReference {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

pub fn owned_by_kind(refs: &[OwnerReference], kind: &str) -> bool {
    refs.iter().any(|r| r.kind == kind)
}
