//! The scheduler host: wraps the scheduling loop around the fake cluster
//! store and exposes the synchronous per-pod dispatch contract.
//!
//! One background thread runs the scheduling loop, fed by pod-created
//! notifications from the store. The driver submits one pod, then blocks on
//! a one-slot rendezvous channel until the update-event handler observes
//! that pod's terminal transition (node name set, or the unschedulable
//! condition appended). Only one pod is in flight at any moment, which is
//! what lets the plugin caches stay single-consumer.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, trace};

use crate::core::common::DEFAULT_SCHEDULER_NAME;
use crate::core::node::Node;
use crate::core::pod::{
    Pod, PodCondition, CONDITION_FALSE, POD_CONDITION_SCHEDULED, POD_REASON_UNSCHEDULABLE,
};
use crate::error::SimonError;
use crate::scheduler::framework::{Code, CycleState, NodeScore};
use crate::scheduler::plugins::{resolve_profile, PluginFactory, Profile, ResolvedPlugins};
use crate::store::{FakeCluster, PodEvent};

/// Terminal outcome of one pod's scheduling attempt.
#[derive(Debug, Clone)]
enum PodOutcome {
    Bound,
    Unschedulable(String),
    Internal(String),
}

enum SchedMsg {
    Schedule(String),
    Shutdown,
}

/// A pod the simulation could not place, with the scheduler's stop message.
#[derive(Debug, Clone, PartialEq)]
pub struct UnscheduledPod {
    pub pod: Pod,
    pub reason: String,
}

pub struct SchedulerHost {
    store: Arc<FakeCluster>,
    queue_tx: Sender<SchedMsg>,
    completion_rx: Receiver<PodOutcome>,
    worker: Option<JoinHandle<()>>,
    closed: bool,
}

impl SchedulerHost {
    pub fn new(
        store: Arc<FakeCluster>,
        profile: &Profile,
        extra_plugins: &HashMap<String, PluginFactory>,
    ) -> Result<Self, SimonError> {
        let plugins = resolve_profile(profile, store.clone(), extra_plugins)?;
        let (completion_tx, completion_rx) = sync_channel::<PodOutcome>(1);
        let (queue_tx, queue_rx) = channel::<SchedMsg>();

        // The informer-side handler: enqueue newly created unbound pods for
        // the loop, and translate terminal pod updates into completions.
        let handler_queue = Mutex::new(queue_tx.clone());
        let handler_completion = Mutex::new(completion_tx.clone());
        store.subscribe_pods(Box::new(move |event| match event {
            PodEvent::Added(pod) => {
                if pod.spec.node_name.is_empty() {
                    let _ = handler_queue
                        .lock()
                        .unwrap()
                        .send(SchedMsg::Schedule(pod.key()));
                }
            }
            PodEvent::Updated { old, new } => {
                let became_bound = old.spec.node_name.is_empty() && !new.spec.node_name.is_empty();
                let became_unschedulable = new.is_unschedulable() && !old.is_unschedulable();
                let outcome = if became_bound {
                    Some(PodOutcome::Bound)
                } else if became_unschedulable {
                    let condition = new
                        .get_condition(POD_CONDITION_SCHEDULED)
                        .cloned()
                        .unwrap_or_default();
                    Some(PodOutcome::Unschedulable(format!(
                        "failed to schedule pod ({}): {}: {}",
                        new.key(),
                        condition.reason,
                        condition.message
                    )))
                } else {
                    None
                };
                if let Some(outcome) = outcome {
                    // dropped defensively once the driver is gone
                    let _ = handler_completion.lock().unwrap().send(outcome);
                }
            }
        }));

        let worker = SchedulingLoop {
            store: store.clone(),
            plugins,
            completion_tx: Mutex::new(completion_tx),
        };
        let handle = std::thread::spawn(move || worker.run(queue_rx));

        Ok(SchedulerHost {
            store,
            queue_tx,
            completion_rx,
            worker: Some(handle),
            closed: false,
        })
    }

    pub fn store(&self) -> Arc<FakeCluster> {
        self.store.clone()
    }

    /// Dispatches pods in order. Each unbound pod is created in the store
    /// and awaited on the completion channel; pods the scheduler rejects
    /// are deleted and recorded. Failures are returned in submission order.
    pub fn schedule_pods(&self, pods: Vec<Pod>) -> Result<Vec<UnscheduledPod>, SimonError> {
        let mut failed = vec![];
        for pod in pods {
            self.store.create_pod(pod.clone()).map_err(|err| {
                SimonError::SeedConflict(format!(
                    "failed to create pod {}: {}",
                    pod.key(),
                    err
                ))
            })?;
            // the field filter only surfaces simulator-owned pods, so only
            // those have a completion to wait for
            if !pod.spec.node_name.is_empty()
                || pod.spec.scheduler_name != DEFAULT_SCHEDULER_NAME
            {
                continue;
            }
            match self.completion_rx.recv() {
                Ok(PodOutcome::Bound) => {}
                Ok(PodOutcome::Unschedulable(reason)) => {
                    self.store.delete_pod(&pod.key()).map_err(|err| {
                        SimonError::PluginInternal(format!(
                            "failed to delete pod {}: {}",
                            pod.key(),
                            err
                        ))
                    })?;
                    failed.push(UnscheduledPod { pod, reason });
                }
                Ok(PodOutcome::Internal(message)) => {
                    return Err(SimonError::PluginInternal(message));
                }
                Err(_) => {
                    return Err(SimonError::PluginInternal(
                        "scheduling loop terminated unexpectedly".to_string(),
                    ));
                }
            }
        }
        Ok(failed)
    }

    /// Idempotent: stops the scheduling loop, then closes the rendezvous
    /// channel (by dropping its receiver with the host).
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.queue_tx.send(SchedMsg::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SchedulerHost {
    fn drop(&mut self) {
        self.close();
    }
}

struct SchedulingLoop {
    store: Arc<FakeCluster>,
    plugins: ResolvedPlugins,
    completion_tx: Mutex<SyncSender<PodOutcome>>,
}

impl SchedulingLoop {
    fn run(self, queue_rx: Receiver<SchedMsg>) {
        while let Ok(message) = queue_rx.recv() {
            match message {
                SchedMsg::Shutdown => break,
                SchedMsg::Schedule(pod_key) => self.schedule_one(&pod_key),
            }
        }
    }

    fn fail_internal(&self, message: String) {
        let _ = self
            .completion_tx
            .lock()
            .unwrap()
            .send(PodOutcome::Internal(message));
    }

    fn schedule_one(&self, pod_key: &str) {
        let pod = match self.store.get_pod(pod_key) {
            Some(pod) => pod,
            // deleted while queued
            None => return,
        };
        let nodes = self.store.list_nodes();
        trace!(
            "considering {} nodes for scheduling pod {}",
            nodes.len(),
            pod_key
        );

        let mut state = CycleState::new();
        let mut feasible: Vec<Node> = vec![];
        let mut rejection_counts: BTreeMap<String, usize> = BTreeMap::new();
        for node in nodes.iter() {
            let mut verdict = None;
            for plugin in &self.plugins.filter {
                let status = plugin.filter(&mut state, &pod, node);
                match status.code {
                    Code::Success => continue,
                    Code::Unschedulable => {
                        verdict = Some(status.message());
                        break;
                    }
                    _ => {
                        self.fail_internal(format!(
                            "filter plugin {} failed for pod {}: {}",
                            plugin.name(),
                            pod_key,
                            status.message()
                        ));
                        return;
                    }
                }
            }
            match verdict {
                None => feasible.push(node.clone()),
                Some(reason) => {
                    *rejection_counts.entry(reason).or_insert(0) += 1;
                }
            }
        }

        if feasible.is_empty() {
            self.mark_unschedulable(pod, nodes.len(), &rejection_counts);
            return;
        }

        let node_name = match self.pick_node(&mut state, &pod, &feasible) {
            Ok(node_name) => node_name,
            Err(message) => {
                self.fail_internal(message);
                return;
            }
        };
        debug!("pod {} assigned node {:?}", pod_key, node_name);

        // reserve phase: roll everything back on the first failure
        for (index, plugin) in self.plugins.reserve.iter().enumerate() {
            let status = plugin.reserve(&mut state, &pod, &node_name);
            if !status.is_success() {
                for executed in self.plugins.reserve[..=index].iter().rev() {
                    executed.unreserve(&mut state, &pod, &node_name);
                }
                self.fail_internal(format!(
                    "reserve plugin {} failed for pod {}: {}",
                    plugin.name(),
                    pod_key,
                    status.message()
                ));
                return;
            }
        }

        // bind chain: Skip hands the pod to the next plugin
        for plugin in &self.plugins.bind {
            let status = plugin.bind(&mut state, &pod, &node_name);
            match status.code {
                Code::Skip => continue,
                Code::Success => return,
                _ => {
                    for executed in self.plugins.reserve.iter().rev() {
                        executed.unreserve(&mut state, &pod, &node_name);
                    }
                    self.fail_internal(format!(
                        "bind plugin {} failed for pod {}: {}",
                        plugin.name(),
                        pod_key,
                        status.message()
                    ));
                    return;
                }
            }
        }
        self.fail_internal(format!("no bind plugin accepted pod {}", pod_key));
    }

    /// Runs the score chain over the feasible nodes and picks the best one.
    /// Ties resolve to the first node in name order, keeping reruns stable.
    fn pick_node(
        &self,
        state: &mut CycleState,
        pod: &Pod,
        feasible: &[Node],
    ) -> Result<String, String> {
        if feasible.len() == 1 {
            return Ok(feasible[0].metadata.name.clone());
        }
        let mut totals: Vec<i64> = vec![0; feasible.len()];
        for (plugin, weight) in &self.plugins.score {
            let mut scores: Vec<NodeScore> = Vec::with_capacity(feasible.len());
            for node in feasible {
                let (score, status) = plugin.score(state, pod, node);
                if !status.is_success() && status.code != Code::Unschedulable {
                    return Err(format!(
                        "score plugin {} failed for pod {}: {}",
                        plugin.name(),
                        pod.key(),
                        status.message()
                    ));
                }
                scores.push(NodeScore {
                    name: node.metadata.name.clone(),
                    score,
                });
            }
            let status = plugin.normalize(pod, &mut scores);
            if !status.is_success() {
                return Err(format!(
                    "normalize of plugin {} failed for pod {}: {}",
                    plugin.name(),
                    pod.key(),
                    status.message()
                ));
            }
            for (total, node_score) in totals.iter_mut().zip(scores.iter()) {
                *total += weight * node_score.score;
            }
        }
        let mut best = 0;
        for index in 1..feasible.len() {
            if totals[index] > totals[best] {
                best = index;
            }
        }
        trace!(
            "pod {} node scores: {:?}",
            pod.key(),
            feasible
                .iter()
                .zip(totals.iter())
                .map(|(n, s)| (n.metadata.name.clone(), *s))
                .collect::<Vec<_>>()
        );
        Ok(feasible[best].metadata.name.clone())
    }

    fn mark_unschedulable(
        &self,
        mut pod: Pod,
        node_count: usize,
        rejection_counts: &BTreeMap<String, usize>,
    ) {
        let mut parts: Vec<String> = rejection_counts
            .iter()
            .map(|(reason, count)| format!("{} {}", count, reason))
            .collect();
        if parts.is_empty() {
            parts.push("no nodes in cluster".to_string());
        }
        let message = format!(
            "0/{} nodes are available: {}.",
            node_count,
            parts.join(", ")
        );
        pod.update_condition(PodCondition {
            condition_type: POD_CONDITION_SCHEDULED.to_string(),
            status: CONDITION_FALSE.to_string(),
            reason: POD_REASON_UNSCHEDULABLE.to_string(),
            message,
        });
        if let Err(err) = self.store.update_pod(pod) {
            self.fail_internal(format!("failed to record unschedulable pod: {}", err));
        }
    }
}
