//! Fractional-GPU plugin: filters and scores nodes by per-device memory
//! availability, reserves a concrete device-id assignment ahead of binding
//! and rolls it back on rejection.
//!
//! The chosen device set is encoded as a dash-joined index string ("2-3-4")
//! in the pod's gpu-index annotation. The per-node device cache is guarded
//! by one RwLock; Reserve and Unreserve hold the write lock. The pending
//! pod-copy map is scoped between Reserve and Bind.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

use crate::core::common::ANNO_GPU_INDEX;
use crate::core::node::{DeviceBrief, Node, NodeGpuInfo};
use crate::core::pod::{Pod, PodPhase};
use crate::scheduler::framework::{
    normalize_min_max, BindPlugin, CycleState, FilterPlugin, NodeScore, Plugin, ReservePlugin,
    ScorePlugin, Status, MAX_NODE_SCORE, MIN_NODE_SCORE,
};
use crate::scheduler::plugins::PluginHandles;
use crate::store::FakeCluster;

#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub idx: usize,
    pub total_memory: i64,
    /// pod key → per-GPU memory occupied on this device
    pub pods: BTreeMap<String, i64>,
}

impl DeviceState {
    pub fn used_memory(&self) -> i64 {
        self.pods.values().sum()
    }

    pub fn available_memory(&self) -> i64 {
        self.total_memory - self.used_memory()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GpuNodeCache {
    pub devs: Vec<DeviceState>,
    pub gpu_count: i64,
    pub gpu_total_memory: i64,
    pub model: String,
}

impl GpuNodeCache {
    fn from_node(node: &Node, pods_on_node: &[Pod]) -> Self {
        let gpu_count = node.gpu_count();
        let gpu_total_memory = node.gpu_total_memory();
        let per_device = if gpu_count > 0 {
            gpu_total_memory / gpu_count
        } else {
            0
        };
        let model = node
            .gpu_share_info()
            .map(|info| info.gpu_model)
            .unwrap_or_default();
        let mut devs: Vec<DeviceState> = (0..gpu_count as usize)
            .map(|idx| DeviceState {
                idx,
                total_memory: per_device,
                pods: BTreeMap::new(),
            })
            .collect();
        for pod in pods_on_node {
            let (memory, _) = pod.gpu_memory_and_count();
            if memory <= 0 {
                continue;
            }
            for idx in pod.gpu_index_list() {
                match devs.get_mut(idx) {
                    Some(dev) => {
                        dev.pods.insert(pod.key(), memory);
                    }
                    None => warn!(
                        "pod {} references GPU {} missing on node {}",
                        pod.key(),
                        idx,
                        node.metadata.name
                    ),
                }
            }
        }
        GpuNodeCache {
            devs,
            gpu_count,
            gpu_total_memory,
            model,
        }
    }

    fn free_device_count(&self) -> i64 {
        self.devs.iter().filter(|d| d.used_memory() == 0).count() as i64
    }

    fn export(&self) -> NodeGpuInfo {
        let mut devs_brief = BTreeMap::new();
        let mut num_pods = 0;
        for dev in &self.devs {
            num_pods += dev.pods.len();
            devs_brief.insert(
                dev.idx,
                DeviceBrief {
                    gpu_total_memory: dev.total_memory,
                    gpu_used_memory: dev.used_memory(),
                    pod_list: dev.pods.keys().cloned().collect(),
                    model: self.model.clone(),
                },
            );
        }
        NodeGpuInfo {
            devs_brief,
            gpu_count: self.gpu_count,
            gpu_model: self.model.clone(),
            gpu_total_memory: self.gpu_total_memory,
            num_pods,
        }
    }
}

/// Chooses the device set for a request of `count` GPUs with `memory` bytes
/// each. Single-GPU requests take the tightest fitting device (smallest
/// index on ties); multi-GPU requests take a two-pointer scan over
/// ascending indices, consuming each accepted device.
pub fn allocate_gpu_id(cache: &GpuNodeCache, memory: i64, count: i64) -> Option<String> {
    if memory <= 0 || count <= 0 || cache.devs.is_empty() {
        return None;
    }
    if count == 1 {
        let mut candidate: Option<(usize, i64)> = None;
        for dev in &cache.devs {
            let available = dev.available_memory();
            if available >= memory {
                let tighter = match candidate {
                    Some((_, best)) => available < best,
                    None => true,
                };
                if tighter {
                    candidate = Some((dev.idx, available));
                }
            }
        }
        return candidate.map(|(idx, _)| idx.to_string());
    }

    let mut chosen = vec![];
    let mut dev_id = 0;
    while dev_id < cache.devs.len() && (chosen.len() as i64) < count {
        if cache.devs[dev_id].available_memory() >= memory {
            chosen.push(dev_id);
        }
        dev_id += 1;
    }
    if chosen.len() as i64 == count {
        Some(
            chosen
                .iter()
                .map(|idx| idx.to_string())
                .collect::<Vec<_>>()
                .join("-"),
        )
    } else {
        None
    }
}

pub struct GpuSharePlugin {
    store: Arc<FakeCluster>,
    cache: RwLock<BTreeMap<String, GpuNodeCache>>,
    /// pod key → annotated pod copy, scoped between Reserve and Bind
    pending: Mutex<BTreeMap<String, Pod>>,
}

impl GpuSharePlugin {
    fn new(store: Arc<FakeCluster>) -> Self {
        GpuSharePlugin {
            store,
            cache: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    fn node_cache(&self, node: &Node) -> GpuNodeCache {
        {
            let cache = self.cache.read().unwrap();
            if let Some(entry) = cache.get(&node.metadata.name) {
                return entry.clone();
            }
        }
        let mut cache = self.cache.write().unwrap();
        cache
            .entry(node.metadata.name.clone())
            .or_insert_with(|| {
                GpuNodeCache::from_node(node, &self.store.pods_on_node(&node.metadata.name))
            })
            .clone()
    }

    /// Writes the exported device map back onto the node annotation and
    /// refreshes the allocatable whole-GPU count.
    fn flush_node(&self, node_name: &str, cache_entry: &GpuNodeCache) -> Status {
        let mut node = match self.store.get_node(node_name) {
            Some(node) => node,
            None => return Status::error(format!("node {:?} not in store", node_name)),
        };
        node.set_gpu_share_info(&cache_entry.export());
        node.status.allocatable.gpu_count = cache_entry.free_device_count();
        match self.store.update_node(node) {
            Ok(()) => Status::success(),
            Err(err) => Status::error(err.to_string()),
        }
    }
}

impl Plugin for GpuSharePlugin {
    fn name(&self) -> &'static str {
        crate::core::common::OPEN_GPU_SHARE_PLUGIN_NAME
    }
}

impl FilterPlugin for GpuSharePlugin {
    fn filter(&self, _state: &mut CycleState, pod: &Pod, node: &Node) -> Status {
        let (memory, count) = pod.gpu_memory_and_count();
        if memory <= 0 {
            return Status::success();
        }
        if node.gpu_total_memory() < memory {
            return Status::unschedulable(format!(
                "node(s) had insufficient GPU memory (node {})",
                node.metadata.name
            ));
        }
        let cache_entry = self.node_cache(node);
        match allocate_gpu_id(&cache_entry, memory, count) {
            Some(_) => Status::success(),
            None => Status::unschedulable(format!(
                "node(s) had no GPU placement for the pod (node {})",
                node.metadata.name
            )),
        }
    }
}

impl ScorePlugin for GpuSharePlugin {
    fn score(&self, _state: &mut CycleState, pod: &Pod, node: &Node) -> (i64, Status) {
        let (memory, count) = pod.gpu_memory_and_count();
        if memory <= 0 {
            return (MAX_NODE_SCORE, Status::success());
        }
        let cache_entry = self.node_cache(node);
        let available_memory: i64 = cache_entry.devs.iter().map(|d| d.available_memory()).sum();
        let available_devices = cache_entry
            .devs
            .iter()
            .filter(|d| d.available_memory() >= memory)
            .count() as i64;
        let requested_memory = memory * count;
        let share = |requested: i64, available: i64| -> f64 {
            crate::algo::share(requested as f64, (available - requested) as f64)
        };
        let dominant = share(requested_memory, available_memory)
            .max(share(count, available_devices));
        (
            ((MAX_NODE_SCORE - MIN_NODE_SCORE) as f64 * dominant) as i64,
            Status::success(),
        )
    }

    fn normalize(&self, _pod: &Pod, scores: &mut [NodeScore]) -> Status {
        normalize_min_max(scores);
        Status::success()
    }
}

impl ReservePlugin for GpuSharePlugin {
    fn reserve(&self, _state: &mut CycleState, pod: &Pod, node_name: &str) -> Status {
        let (memory, count) = pod.gpu_memory_and_count();
        if memory <= 0 {
            return Status::success();
        }
        let node = match self.store.get_node(node_name) {
            Some(node) => node,
            None => return Status::error(format!("node {:?} not in store", node_name)),
        };
        // populate outside the write lock
        self.node_cache(&node);

        let mut cache = self.cache.write().unwrap();
        let entry = match cache.get_mut(node_name) {
            Some(entry) => entry,
            None => return Status::error(format!("no GPU cache for node {:?}", node_name)),
        };
        let device_id = match allocate_gpu_id(entry, memory, count) {
            Some(device_id) => device_id,
            None => {
                return Status::error(format!(
                    "node {} can't place pod {} at reserve time",
                    node_name,
                    pod.key()
                ))
            }
        };

        let mut pod_copy = pod.clone();
        pod_copy.metadata.set_annotation(ANNO_GPU_INDEX, &device_id);
        pod_copy.spec.node_name = node_name.to_string();
        pod_copy.status.phase = PodPhase::Running;

        for idx in pod_copy.gpu_index_list() {
            if let Some(dev) = entry.devs.get_mut(idx) {
                dev.pods.insert(pod_copy.key(), memory);
            }
        }
        self.pending
            .lock()
            .unwrap()
            .insert(pod_copy.key(), pod_copy);
        let snapshot = entry.clone();
        drop(cache);
        self.flush_node(node_name, &snapshot)
    }

    fn unreserve(&self, _state: &mut CycleState, pod: &Pod, node_name: &str) {
        let pod_copy = match self.pending.lock().unwrap().remove(&pod.key()) {
            Some(pod_copy) => pod_copy,
            None => return,
        };
        let mut cache = self.cache.write().unwrap();
        let entry = match cache.get_mut(node_name) {
            Some(entry) => entry,
            None => return,
        };
        for idx in pod_copy.gpu_index_list() {
            if let Some(dev) = entry.devs.get_mut(idx) {
                dev.pods.remove(&pod_copy.key());
            }
        }
        let snapshot = entry.clone();
        drop(cache);
        let status = self.flush_node(node_name, &snapshot);
        if !status.is_success() {
            warn!("unreserve of pod {} failed: {}", pod.key(), status.message());
        }
    }
}

impl BindPlugin for GpuSharePlugin {
    fn bind(&self, _state: &mut CycleState, pod: &Pod, _node_name: &str) -> Status {
        let (memory, _) = pod.gpu_memory_and_count();
        if memory <= 0 {
            return Status::skip();
        }
        let pod_copy = match self.pending.lock().unwrap().remove(&pod.key()) {
            Some(pod_copy) => pod_copy,
            None => {
                return Status::error(format!(
                    "no pending pod copy for {}, which should not happen since it \
                     would have failed in Reserve",
                    pod.key()
                ))
            }
        };
        if let Err(err) = self.store.update_pod(pod_copy) {
            return Status::error(err.to_string());
        }
        Status::skip()
    }
}

pub fn factory(store: Arc<FakeCluster>) -> PluginHandles {
    let plugin = Arc::new(GpuSharePlugin::new(store));
    PluginHandles {
        filter: Some(plugin.clone()),
        score: Some(plugin.clone()),
        reserve: Some(plugin.clone()),
        bind: Some(plugin),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(per_device: i64, used: &[i64]) -> GpuNodeCache {
        let devs = used
            .iter()
            .enumerate()
            .map(|(idx, used)| {
                let mut pods = BTreeMap::new();
                if *used > 0 {
                    pods.insert(format!("ns/occupant-{}", idx), *used);
                }
                DeviceState {
                    idx,
                    total_memory: per_device,
                    pods,
                }
            })
            .collect::<Vec<_>>();
        GpuNodeCache {
            gpu_count: devs.len() as i64,
            gpu_total_memory: per_device * devs.len() as i64,
            model: String::new(),
            devs,
        }
    }

    const GIB: i64 = 1 << 30;

    #[test]
    fn test_single_gpu_takes_tightest_fit() {
        // dev1 has less headroom but still fits: tightest fit wins
        let cache = cache(16 * GIB, &[0, 4 * GIB, 0, 0]);
        assert_eq!(
            Some("1".to_string()),
            allocate_gpu_id(&cache, 12 * GIB, 1)
        );
    }

    #[test]
    fn test_single_gpu_prefers_smallest_index_on_ties() {
        let cache = cache(16 * GIB, &[0, 0, 0, 0]);
        assert_eq!(
            Some("0".to_string()),
            allocate_gpu_id(&cache, 12 * GIB, 1)
        );
    }

    #[test]
    fn test_multi_gpu_two_pointer_scan() {
        let cache = cache(16 * GIB, &[0, 0, 0, 0]);
        assert_eq!(
            Some("0-1-2".to_string()),
            allocate_gpu_id(&cache, 10 * GIB, 3)
        );
    }

    #[test]
    fn test_multi_gpu_skips_busy_devices() {
        let cache = cache(16 * GIB, &[10 * GIB, 0, 10 * GIB, 0]);
        assert_eq!(
            Some("1-3".to_string()),
            allocate_gpu_id(&cache, 10 * GIB, 2)
        );
    }

    #[test]
    fn test_multi_gpu_rejects_on_exhaustion() {
        let cache = cache(16 * GIB, &[0, 0]);
        assert_eq!(None, allocate_gpu_id(&cache, 10 * GIB, 3));
    }

    #[test]
    fn test_zero_request_is_rejected() {
        let cache = cache(16 * GIB, &[0, 0]);
        assert_eq!(None, allocate_gpu_id(&cache, 0, 1));
    }
}
