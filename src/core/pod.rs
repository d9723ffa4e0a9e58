//! Pod primitive: the central entity of the simulation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::common::{
    owned_by_kind, ObjectMeta, ANNO_CONFIG_MIRROR, ANNO_CONFIG_SOURCE, ANNO_GPU_INDEX,
    ANNO_POD_LOCAL_STORAGE, CONFIG_SOURCE_API, KIND_DAEMON_SET,
};
use crate::core::resources::RuntimeResources;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    pub containers: Vec<Container>,
    pub node_selector: BTreeMap<String, String>,
    pub affinity: Option<Affinity>,
    pub tolerations: Vec<Toleration>,
    /// Empty means the pod still needs scheduling.
    pub node_name: String,
    pub scheduler_name: String,
    pub restart_policy: String,
    pub dns_policy: String,
    pub volumes: Vec<PodVolume>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub requests: RuntimeResources,
    pub limits: RuntimeResources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodVolume {
    pub name: String,
    pub persistent_volume_claim: Option<PvcVolumeSource>,
    pub host_path: Option<HostPathVolumeSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PvcVolumeSource {
    pub claim_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostPathVolumeSource {
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Toleration {
    pub key: String,
    pub operator: TolerationOperator,
    pub value: String,
    /// Empty matches every effect.
    pub effect: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Affinity {
    pub node_affinity: Option<NodeAffinity>,
    pub pod_affinity: Option<PodAffinity>,
    pub pod_anti_affinity: Option<PodAffinity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeAffinity {
    #[serde(rename = "requiredDuringSchedulingIgnoredDuringExecution")]
    pub required: Option<NodeSelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSelector {
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSelectorTerm {
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: NodeSelectorOperator,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum NodeSelectorOperator {
    #[default]
    In,
    NotIn,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodAffinity {
    #[serde(rename = "requiredDuringSchedulingIgnoredDuringExecution")]
    pub required: Vec<PodAffinityTerm>,
    #[serde(rename = "preferredDuringSchedulingIgnoredDuringExecution")]
    pub preferred: Vec<WeightedPodAffinityTerm>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodAffinityTerm {
    pub label_selector: Option<LabelSelector>,
    pub topology_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedPodAffinityTerm {
    pub weight: i64,
    pub pod_affinity_term: PodAffinityTerm,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum LabelSelectorOperator {
    #[default]
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodStatus {
    pub phase: PodPhase,
    pub conditions: Vec<PodCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

pub const POD_CONDITION_SCHEDULED: &str = "PodScheduled";
pub const POD_REASON_UNSCHEDULABLE: &str = "Unschedulable";
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
}

/// The pod-side local storage request stored as a JSON annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeRequest {
    pub volumes: Vec<VolumeClaim>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaim {
    pub kind: VolumeKind,
    /// bytes
    pub size: i64,
    pub storage_class: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    #[serde(rename = "LVM")]
    Lvm,
    #[serde(rename = "SSD")]
    Ssd,
    #[serde(rename = "HDD")]
    Hdd,
}

impl Pod {
    /// Store key: `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    /// Total requested standard resources, summed over container requests.
    /// GPU demand is declared through container limits and accounted by the
    /// GPU-share plugin, never here.
    pub fn calculate_requested_resources(&self) -> RuntimeResources {
        let mut total = RuntimeResources::default();
        for container in &self.spec.containers {
            total.cpu += container.resources.requests.cpu;
            total.memory += container.resources.requests.memory;
            total.ephemeral_storage += container.resources.requests.ephemeral_storage;
        }
        total
    }

    /// Per-GPU memory and GPU count requested by the pod, read from container
    /// limits. A pod requesting memory without a count is revised to one GPU.
    pub fn gpu_memory_and_count(&self) -> (i64, i64) {
        let mut memory = 0;
        let mut count = 0;
        for container in &self.spec.containers {
            memory += container.resources.limits.gpu_memory;
            count += container.resources.limits.gpu_count;
        }
        if memory > 0 && count <= 0 {
            count = 1;
        }
        (memory, count)
    }

    pub fn gpu_index_annotation(&self) -> Option<&String> {
        self.metadata.annotations.get(ANNO_GPU_INDEX)
    }

    /// Decodes the dash-joined GPU index annotation, e.g. `"2-3-4"`.
    pub fn gpu_index_list(&self) -> Vec<usize> {
        match self.gpu_index_annotation() {
            Some(raw) => raw.split('-').filter_map(|s| s.parse().ok()).collect(),
            None => vec![],
        }
    }

    pub fn volume_request(&self) -> Option<VolumeRequest> {
        let raw = self.metadata.annotations.get(ANNO_POD_LOCAL_STORAGE)?;
        serde_json::from_str(raw).ok()
    }

    pub fn is_owned_by_daemon_set(&self) -> bool {
        owned_by_kind(&self.metadata.owner_references, KIND_DAEMON_SET)
    }

    pub fn is_mirror_pod(&self) -> bool {
        self.metadata.annotations.contains_key(ANNO_CONFIG_MIRROR)
    }

    pub fn is_static_pod(&self) -> bool {
        match self.metadata.annotations.get(ANNO_CONFIG_SOURCE) {
            Some(source) => source != CONFIG_SOURCE_API,
            None => false,
        }
    }

    pub fn get_condition(&self, condition_type: &str) -> Option<&PodCondition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn update_condition(&mut self, condition: PodCondition) {
        match self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => *existing = condition,
            None => self.status.conditions.push(condition),
        }
    }

    pub fn is_unschedulable(&self) -> bool {
        match self.get_condition(POD_CONDITION_SCHEDULED) {
            Some(c) => c.status == CONDITION_FALSE && c.reason == POD_REASON_UNSCHEDULABLE,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_pod_manifest() {
        let yaml = r#"
        metadata:
          name: busybox
          namespace: simple
        spec:
          nodeSelector:
            node-role.kubernetes.io/master: ""
          tolerations:
          - key: node-role.kubernetes.io/master
            operator: Exists
            effect: NoSchedule
          containers:
          - name: main
            image: busybox
            resources:
              requests:
                cpu: 1500m
                memory: 1Gi
        "#;
        let pod: Pod = serde_yaml::from_str(yaml).unwrap();
        assert_eq!("busybox", pod.metadata.name);
        assert_eq!(1, pod.spec.tolerations.len());
        assert_eq!(TolerationOperator::Exists, pod.spec.tolerations[0].operator);
        let requested = pod.calculate_requested_resources();
        assert_eq!(1500, requested.cpu);
        assert_eq!(1024 * 1024 * 1024, requested.memory);
    }

    #[test]
    fn test_gpu_memory_and_count_revises_zero_count() {
        let mut pod = Pod::default();
        pod.spec.containers.push(Container {
            name: "main".to_string(),
            image: "cuda".to_string(),
            resources: ResourceRequirements {
                limits: RuntimeResources {
                    gpu_memory: 12 << 30,
                    ..Default::default()
                },
                ..Default::default()
            },
        });
        assert_eq!((12 << 30, 1), pod.gpu_memory_and_count());
    }

    #[test]
    fn test_gpu_index_list_decoding() {
        let mut pod = Pod::default();
        pod.metadata.set_annotation(ANNO_GPU_INDEX, "2-3-4");
        assert_eq!(vec![2, 3, 4], pod.gpu_index_list());
        pod.metadata.set_annotation(ANNO_GPU_INDEX, "1");
        assert_eq!(vec![1], pod.gpu_index_list());
    }
}
