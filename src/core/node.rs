//! Node primitive and the typed views of its local-storage and GPU-share
//! annotations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::common::{
    ObjectMeta, ANNO_NODE_GPU_SHARE, ANNO_NODE_LOCAL_STORAGE, LABEL_MASTER_ROLE,
    TAINT_EFFECT_NO_SCHEDULE, TAINT_UNSCHEDULABLE,
};
use crate::core::resources::RuntimeResources;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub metadata: ObjectMeta,
    pub spec: NodeSpec,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    pub taints: Vec<Taint>,
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStatus {
    pub capacity: RuntimeResources,
    pub allocatable: RuntimeResources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

impl Taint {
    pub fn unschedulable() -> Self {
        Taint {
            key: TAINT_UNSCHEDULABLE.to_string(),
            value: String::new(),
            effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
        }
    }
}

pub fn taint_exists(taint: &Taint, taints: &[Taint]) -> bool {
    taints.iter().any(|t| t == taint)
}

/// JSON shape of the node local-storage annotation and its sidecar file:
/// `{vgs: [{name, capacity, requested}], devices: [{device, mediaType,
/// capacity, isAllocated}]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStorage {
    pub vgs: Vec<VirtualGroup>,
    pub devices: Vec<BlockDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualGroup {
    pub name: String,
    pub capacity: i64,
    pub requested: i64,
}

impl VirtualGroup {
    pub fn free(&self) -> i64 {
        self.capacity - self.requested
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockDevice {
    pub device: String,
    pub media_type: String,
    pub capacity: i64,
    pub is_allocated: bool,
}

/// JSON shape of the GPU-share node annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeGpuInfo {
    pub devs_brief: BTreeMap<usize, DeviceBrief>,
    pub gpu_count: i64,
    pub gpu_model: String,
    pub gpu_total_memory: i64,
    pub num_pods: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceBrief {
    pub gpu_total_memory: i64,
    pub gpu_used_memory: i64,
    pub pod_list: Vec<String>,
    pub model: String,
}

impl Node {
    pub fn is_master(&self) -> bool {
        self.metadata.has_label(LABEL_MASTER_ROLE)
    }

    pub fn has_unschedulable_taint(&self) -> bool {
        taint_exists(&Taint::unschedulable(), &self.spec.taints)
    }

    pub fn local_storage(&self) -> Option<NodeStorage> {
        let raw = self.metadata.annotations.get(ANNO_NODE_LOCAL_STORAGE)?;
        serde_json::from_str(raw).ok()
    }

    pub fn set_local_storage(&mut self, storage: &NodeStorage) {
        let data = serde_json::to_string(storage).expect("node storage serializes");
        self.metadata
            .set_annotation(ANNO_NODE_LOCAL_STORAGE, &data);
    }

    pub fn gpu_share_info(&self) -> Option<NodeGpuInfo> {
        let raw = self.metadata.annotations.get(ANNO_NODE_GPU_SHARE)?;
        serde_json::from_str(raw).ok()
    }

    pub fn set_gpu_share_info(&mut self, info: &NodeGpuInfo) {
        let data = serde_json::to_string(info).expect("gpu info serializes");
        self.metadata.set_annotation(ANNO_NODE_GPU_SHARE, &data);
    }

    pub fn gpu_count(&self) -> i64 {
        self.status.allocatable.gpu_count
    }

    pub fn gpu_total_memory(&self) -> i64 {
        self.status.allocatable.gpu_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_node_manifest() {
        let yaml = r#"
        metadata:
          name: worker-1
          labels:
            kubernetes.io/hostname: worker-1
            node-role.kubernetes.io/worker: ""
        status:
          capacity:
            cpu: "8"
            memory: 16Gi
          allocatable:
            cpu: "8"
            memory: 16Gi
        "#;
        let node: Node = serde_yaml::from_str(yaml).unwrap();
        assert_eq!("worker-1", node.metadata.name);
        assert_eq!(8000, node.status.allocatable.cpu);
        assert!(!node.is_master());
    }

    #[test]
    fn test_local_storage_annotation_round_trip() {
        let mut node = Node::default();
        let storage = NodeStorage {
            vgs: vec![VirtualGroup {
                name: "pool0".to_string(),
                capacity: 107374182400,
                requested: 0,
            }],
            devices: vec![BlockDevice {
                device: "/dev/vdd".to_string(),
                media_type: "hdd".to_string(),
                capacity: 107374182400,
                is_allocated: false,
            }],
        };
        node.set_local_storage(&storage);
        assert_eq!(Some(storage), node.local_storage());
    }

    #[test]
    fn test_unschedulable_taint_detection() {
        let mut node = Node::default();
        assert!(!node.has_unschedulable_taint());
        node.spec.taints.push(Taint::unschedulable());
        assert!(node.has_unschedulable_taint());
    }
}
