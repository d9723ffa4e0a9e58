//! Filter/score/bind plugin for local-storage claims: LVM claims placed on
//! volume groups, exclusive claims matched against whole block devices.
//!
//! All state lives in the node's local-storage annotation; Bind re-runs the
//! deterministic placement and writes the updated annotation back through
//! the store, then returns `Skip` so the bind chain continues.

use std::sync::Arc;

use crate::core::node::{Node, NodeStorage};
use crate::core::pod::{Pod, VolumeClaim, VolumeKind, VolumeRequest};
use crate::scheduler::framework::{
    normalize_min_max, BindPlugin, CycleState, FilterPlugin, NodeScore, Plugin, ScorePlugin,
    Status, MAX_NODE_SCORE, MIN_NODE_SCORE,
};
use crate::scheduler::plugins::PluginHandles;
use crate::store::FakeCluster;

pub struct LocalPlugin {
    store: Arc<FakeCluster>,
}

impl Plugin for LocalPlugin {
    fn name(&self) -> &'static str {
        crate::core::common::OPEN_LOCAL_PLUGIN_NAME
    }
}

/// One placement decision for a pod's claims against a node's pools.
#[derive(Debug, Clone, PartialEq)]
pub enum PlacementUnit {
    Lvm { vg: String, size: i64 },
    Device { device: String, size: i64 },
}

/// Places every claim of the request onto the storage copy, tightest pool
/// or device first, mutating `storage` as it goes. Fails with the claim
/// that could not be placed.
pub fn place_volumes(
    storage: &mut NodeStorage,
    request: &VolumeRequest,
) -> Result<Vec<PlacementUnit>, VolumeClaim> {
    let mut units = vec![];
    for claim in &request.volumes {
        match claim.kind {
            VolumeKind::Lvm => {
                let candidate = storage
                    .vgs
                    .iter_mut()
                    .filter(|vg| vg.free() >= claim.size)
                    .min_by_key(|vg| vg.free());
                match candidate {
                    Some(vg) => {
                        vg.requested += claim.size;
                        units.push(PlacementUnit::Lvm {
                            vg: vg.name.clone(),
                            size: claim.size,
                        });
                    }
                    None => return Err(claim.clone()),
                }
            }
            VolumeKind::Ssd | VolumeKind::Hdd => {
                let media = match claim.kind {
                    VolumeKind::Ssd => "ssd",
                    _ => "hdd",
                };
                let candidate = storage
                    .devices
                    .iter_mut()
                    .filter(|d| !d.is_allocated && d.media_type == media && d.capacity >= claim.size)
                    .min_by_key(|d| d.capacity);
                match candidate {
                    Some(device) => {
                        device.is_allocated = true;
                        units.push(PlacementUnit::Device {
                            device: device.device.clone(),
                            size: claim.size,
                        });
                    }
                    None => return Err(claim.clone()),
                }
            }
        }
    }
    Ok(units)
}

fn pod_local_volumes(pod: &Pod) -> Option<VolumeRequest> {
    match pod.volume_request() {
        Some(request) if !request.volumes.is_empty() => Some(request),
        _ => None,
    }
}

impl FilterPlugin for LocalPlugin {
    fn filter(&self, _state: &mut CycleState, pod: &Pod, node: &Node) -> Status {
        let request = match pod_local_volumes(pod) {
            Some(request) => request,
            None => return Status::success(),
        };
        let mut storage = match node.local_storage() {
            Some(storage) => storage,
            None => {
                return Status::unschedulable(format!(
                    "no local storage found in node {}",
                    node.metadata.name
                ))
            }
        };
        match place_volumes(&mut storage, &request) {
            Ok(_) => Status::success(),
            Err(claim) => Status::unschedulable(format!(
                "node(s) could not place local volume ({} {} bytes)",
                claim.storage_class, claim.size
            )),
        }
    }
}

impl ScorePlugin for LocalPlugin {
    fn score(&self, _state: &mut CycleState, pod: &Pod, node: &Node) -> (i64, Status) {
        let request = pod_local_volumes(pod);
        let storage = node.local_storage();
        match (&request, &storage) {
            (None, None) => return (MAX_NODE_SCORE, Status::success()),
            (None, Some(_)) => return (MIN_NODE_SCORE, Status::success()),
            (Some(_), None) => {
                // combines with Filter's reject so the node is unselectable
                return (
                    MIN_NODE_SCORE,
                    Status::unschedulable(format!(
                        "no local storage found in node {}",
                        node.metadata.name
                    )),
                );
            }
            (Some(_), Some(_)) => {}
        }
        let request = request.unwrap();
        let mut storage = storage.unwrap();
        match place_volumes(&mut storage, &request) {
            Ok(units) => {
                // pack-first: the fuller the touched pools end up, the higher
                // the score
                let mut used = 0_i64;
                let mut capacity = 0_i64;
                for unit in &units {
                    match unit {
                        PlacementUnit::Lvm { vg, .. } => {
                            if let Some(group) = storage.vgs.iter().find(|g| &g.name == vg) {
                                used += group.requested;
                                capacity += group.capacity;
                            }
                        }
                        PlacementUnit::Device { device, size } => {
                            if let Some(dev) =
                                storage.devices.iter().find(|d| &d.device == device)
                            {
                                used += *size;
                                capacity += dev.capacity;
                            }
                        }
                    }
                }
                if capacity == 0 {
                    return (MIN_NODE_SCORE, Status::success());
                }
                let score = (MAX_NODE_SCORE as f64 * used as f64 / capacity as f64) as i64;
                (score, Status::success())
            }
            Err(_) => (MIN_NODE_SCORE, Status::success()),
        }
    }

    fn normalize(&self, _pod: &Pod, scores: &mut [NodeScore]) -> Status {
        normalize_min_max(scores);
        Status::success()
    }
}

impl BindPlugin for LocalPlugin {
    fn bind(&self, _state: &mut CycleState, pod: &Pod, node_name: &str) -> Status {
        let request = match pod_local_volumes(pod) {
            Some(request) => request,
            None => return Status::skip(),
        };
        let mut node = match self.store.get_node(node_name) {
            Some(node) => node,
            None => return Status::error(format!("node {:?} not in store", node_name)),
        };
        let mut storage = match node.local_storage() {
            Some(storage) => storage,
            None => return Status::skip(),
        };
        if let Err(claim) = place_volumes(&mut storage, &request) {
            return Status::error(format!(
                "local volume ({} {} bytes) no longer places on node {}",
                claim.storage_class, claim.size, node_name
            ));
        }
        node.set_local_storage(&storage);
        if let Err(err) = self.store.update_node(node) {
            return Status::error(err.to_string());
        }
        // always hand the pod to the next bind plugin
        Status::skip()
    }
}

pub fn factory(store: Arc<FakeCluster>) -> PluginHandles {
    let plugin = Arc::new(LocalPlugin { store });
    PluginHandles {
        filter: Some(plugin.clone()),
        score: Some(plugin.clone()),
        bind: Some(plugin),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::{BlockDevice, VirtualGroup};

    fn storage_two_pools() -> NodeStorage {
        NodeStorage {
            vgs: vec![
                VirtualGroup {
                    name: "pool0".to_string(),
                    capacity: 100 << 30,
                    requested: 0,
                },
                VirtualGroup {
                    name: "pool1".to_string(),
                    capacity: 10 << 30,
                    requested: 0,
                },
            ],
            devices: vec![
                BlockDevice {
                    device: "/dev/vdd".to_string(),
                    media_type: "hdd".to_string(),
                    capacity: 100 << 30,
                    is_allocated: false,
                },
                BlockDevice {
                    device: "/dev/vde".to_string(),
                    media_type: "ssd".to_string(),
                    capacity: 50 << 30,
                    is_allocated: false,
                },
            ],
        }
    }

    fn claim(kind: VolumeKind, size: i64) -> VolumeClaim {
        VolumeClaim {
            kind,
            size,
            storage_class: "open-local-lvm".to_string(),
        }
    }

    #[test]
    fn test_lvm_claim_takes_tightest_fitting_vg() {
        let mut storage = storage_two_pools();
        let request = VolumeRequest {
            volumes: vec![claim(VolumeKind::Lvm, 5 << 30)],
        };
        let units = place_volumes(&mut storage, &request).unwrap();
        assert_eq!(
            vec![PlacementUnit::Lvm {
                vg: "pool1".to_string(),
                size: 5 << 30
            }],
            units
        );
        assert_eq!(5 << 30, storage.vgs[1].requested);
    }

    #[test]
    fn test_device_claim_matches_media_type() {
        let mut storage = storage_two_pools();
        let request = VolumeRequest {
            volumes: vec![VolumeClaim {
                kind: VolumeKind::Ssd,
                size: 20 << 30,
                storage_class: "open-local-device-ssd".to_string(),
            }],
        };
        let units = place_volumes(&mut storage, &request).unwrap();
        assert_eq!(
            vec![PlacementUnit::Device {
                device: "/dev/vde".to_string(),
                size: 20 << 30
            }],
            units
        );
        assert!(storage.devices[1].is_allocated);
    }

    #[test]
    fn test_placement_fails_when_no_pool_fits() {
        let mut storage = storage_two_pools();
        let request = VolumeRequest {
            volumes: vec![claim(VolumeKind::Lvm, 200 << 30)],
        };
        assert!(place_volumes(&mut storage, &request).is_err());
    }

    #[test]
    fn test_two_exclusive_claims_cannot_share_a_device() {
        let mut storage = storage_two_pools();
        let request = VolumeRequest {
            volumes: vec![
                VolumeClaim {
                    kind: VolumeKind::Hdd,
                    size: 10 << 30,
                    storage_class: "open-local-device-hdd".to_string(),
                },
                VolumeClaim {
                    kind: VolumeKind::Hdd,
                    size: 10 << 30,
                    storage_class: "open-local-device-hdd".to_string(),
                },
            ],
        };
        assert!(place_volumes(&mut storage, &request).is_err());
    }
}
