//! The default scorer and terminal binder.
//!
//! Scoring is the dominant-resource share of the pod against the node's
//! remaining capacity: packing-first, so score order cooperates with the
//! greedy queue's sort key. Binding mutates the pod in the store, which
//! both persists the decision and fires the update event the driver's
//! completion channel depends on.

use std::sync::Arc;

use log::error;

use crate::algo::share;
use crate::core::node::Node;
use crate::core::pod::{Pod, PodPhase};
use crate::scheduler::framework::{
    normalize_min_max, BindPlugin, CycleState, NodeScore, Plugin, ScorePlugin, Status,
    MAX_NODE_SCORE, MIN_NODE_SCORE,
};
use crate::scheduler::plugins::defaults::cycle_pod_requests;
use crate::scheduler::plugins::PluginHandles;
use crate::store::FakeCluster;

pub struct SimonPlugin {
    store: Arc<FakeCluster>,
}

impl Plugin for SimonPlugin {
    fn name(&self) -> &'static str {
        crate::core::common::SIMON_PLUGIN_NAME
    }
}

impl ScorePlugin for SimonPlugin {
    fn score(&self, state: &mut CycleState, pod: &Pod, node: &Node) -> (i64, Status) {
        let requests = cycle_pod_requests(state, pod);
        if requests.is_zero() {
            return (MAX_NODE_SCORE, Status::success());
        }
        let available = match self.store.node_available(&node.metadata.name) {
            Some(available) => available,
            None => {
                return (
                    MIN_NODE_SCORE,
                    Status::error(format!("node {:?} not in store", node.metadata.name)),
                )
            }
        };
        let mut dominant = 0.0_f64;
        for (kind, requested) in requests.iter() {
            let after = available.get(kind) - requested;
            let resource_share = share(requested as f64, after as f64);
            if resource_share > dominant {
                dominant = resource_share;
            }
        }
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

impl BindPlugin for SimonPlugin {
    fn bind(&self, _state: &mut CycleState, pod: &Pod, node_name: &str) -> Status {
        let mut stored = match self.store.get_pod(&pod.key()) {
            Some(stored) => stored,
            None => {
                error!("bind: pod {} vanished from the store", pod.key());
                return Status::error(format!("unable to bind: pod {} not found", pod.key()));
            }
        };
        stored.spec.node_name = node_name.to_string();
        stored.status.phase = PodPhase::Running;
        if let Err(err) = self.store.update_pod(stored) {
            error!("bind: update of pod {} failed: {}", pod.key(), err);
            return Status::error(format!("unable to bind: {}", err));
        }
        Status::success()
    }
}

pub fn factory(store: Arc<FakeCluster>) -> PluginHandles {
    let plugin = Arc::new(SimonPlugin { store });
    PluginHandles {
        score: Some(plugin.clone()),
        bind: Some(plugin),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::common::DEFAULT_SCHEDULER_NAME;
    use crate::core::pod::{Container, ResourceRequirements};
    use crate::core::resources::RuntimeResources;

    fn make_node(name: &str, cpu: i64, memory: i64) -> Node {
        let mut node = Node::default();
        node.metadata.name = name.to_string();
        node.status.allocatable.cpu = cpu;
        node.status.allocatable.memory = memory;
        node.status.capacity = node.status.allocatable;
        node
    }

    fn make_pod(cpu: i64, memory: i64) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = "pod".to_string();
        pod.metadata.namespace = "default".to_string();
        pod.spec.scheduler_name = DEFAULT_SCHEDULER_NAME.to_string();
        pod.spec.containers.push(Container {
            resources: ResourceRequirements {
                requests: RuntimeResources {
                    cpu,
                    memory,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_tighter_node_scores_higher() {
        let store = Arc::new(FakeCluster::new());
        store.create_node(make_node("tight", 2000, 4 << 30)).unwrap();
        store.create_node(make_node("roomy", 16000, 64 << 30)).unwrap();
        let plugin = SimonPlugin {
            store: store.clone(),
        };
        let pod = make_pod(1500, 1 << 30);

        let mut state = CycleState::new();
        let (tight, _) = plugin.score(&mut state, &pod, &store.get_node("tight").unwrap());
        let (roomy, _) = plugin.score(&mut state, &pod, &store.get_node("roomy").unwrap());
        assert!(tight > roomy, "tight={} roomy={}", tight, roomy);
    }

    #[test]
    fn test_bind_sets_node_name_and_phase() {
        let store = Arc::new(FakeCluster::new());
        store.create_node(make_node("node-1", 2000, 4 << 30)).unwrap();
        let pod = make_pod(500, 1 << 30);
        store.create_pod(pod.clone()).unwrap();

        let plugin = SimonPlugin {
            store: store.clone(),
        };
        let mut state = CycleState::new();
        assert!(plugin.bind(&mut state, &pod, "node-1").is_success());
        let bound = store.get_pod(&pod.key()).unwrap();
        assert_eq!("node-1", bound.spec.node_name);
        assert_eq!(PodPhase::Running, bound.status.phase);
    }
}
