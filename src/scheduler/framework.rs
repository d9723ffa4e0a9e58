//! The scheduling-framework surface: extension-point traits, plugin
//! statuses and the per-cycle scratch state.
//!
//! The extension points mirror their namesakes in the upstream scheduler:
//! Filter evaluates feasibility per node, Score ranks feasible nodes,
//! Reserve/Unreserve commit and roll back plugin-local accounting, and Bind
//! persists the decision. A Bind plugin returning `Skip` hands the pod to
//! the next bind plugin in the chain.

use downcast_rs::{impl_downcast, Downcast};
use std::collections::HashMap;

use crate::core::node::Node;
use crate::core::pod::Pod;

pub const MAX_NODE_SCORE: i64 = 100;
pub const MIN_NODE_SCORE: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Code {
    Success,
    /// Internal plugin failure; never used for expected rejections.
    Error,
    Unschedulable,
    /// A bind plugin chose not to handle the pod.
    Skip,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub code: Code,
    pub reasons: Vec<String>,
}

impl Default for Status {
    fn default() -> Self {
        Status {
            code: Code::Success,
            reasons: vec![],
        }
    }
}

impl Status {
    pub fn success() -> Self {
        Default::default()
    }

    pub fn unschedulable(reason: impl Into<String>) -> Self {
        Status {
            code: Code::Unschedulable,
            reasons: vec![reason.into()],
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Status {
            code: Code::Error,
            reasons: vec![reason.into()],
        }
    }

    pub fn skip() -> Self {
        Status {
            code: Code::Skip,
            reasons: vec![],
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }

    pub fn message(&self) -> String {
        self.reasons.join("; ")
    }
}

/// Typed value stored in [`CycleState`].
pub trait StateData: Downcast + Send + Sync {}
impl_downcast!(StateData);

/// Scratch state shared by plugins within one scheduling cycle.
#[derive(Default)]
pub struct CycleState {
    storage: HashMap<&'static str, Box<dyn StateData>>,
}

impl CycleState {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn write(&mut self, key: &'static str, value: Box<dyn StateData>) {
        self.storage.insert(key, value);
    }

    pub fn read<T: StateData>(&self, key: &str) -> Option<&T> {
        self.storage.get(key)?.downcast_ref::<T>()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub name: String,
    pub score: i64,
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;
}

pub trait FilterPlugin: Plugin {
    fn filter(&self, state: &mut CycleState, pod: &Pod, node: &Node) -> Status;
}

pub trait ScorePlugin: Plugin {
    fn score(&self, state: &mut CycleState, pod: &Pod, node: &Node) -> (i64, Status);

    /// Invoked once per cycle with the scores of every feasible node.
    fn normalize(&self, _pod: &Pod, _scores: &mut [NodeScore]) -> Status {
        Status::success()
    }
}

pub trait ReservePlugin: Plugin {
    fn reserve(&self, state: &mut CycleState, pod: &Pod, node_name: &str) -> Status;

    /// Rolls a reservation back; must be idempotent.
    fn unreserve(&self, state: &mut CycleState, pod: &Pod, node_name: &str);
}

pub trait BindPlugin: Plugin {
    fn bind(&self, state: &mut CycleState, pod: &Pod, node_name: &str) -> Status;
}

/// Linearly rescales scores into `[MIN_NODE_SCORE, MAX_NODE_SCORE]`.
/// All-equal inputs collapse to the minimum score.
pub fn normalize_min_max(scores: &mut [NodeScore]) {
    let mut highest = i64::MIN;
    let mut lowest = i64::MAX;
    for node_score in scores.iter() {
        highest = highest.max(node_score.score);
        lowest = lowest.min(node_score.score);
    }
    let old_range = highest - lowest;
    let new_range = MAX_NODE_SCORE - MIN_NODE_SCORE;
    for node_score in scores.iter_mut() {
        if old_range == 0 {
            node_score.score = MIN_NODE_SCORE;
        } else {
            node_score.score =
                (node_score.score - lowest) * new_range / old_range + MIN_NODE_SCORE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        value: i64,
    }
    impl StateData for Dummy {}

    #[test]
    fn test_cycle_state_round_trip() {
        let mut state = CycleState::new();
        state.write("dummy", Box::new(Dummy { value: 42 }));
        assert_eq!(42, state.read::<Dummy>("dummy").unwrap().value);
        assert!(state.read::<Dummy>("missing").is_none());
    }

    #[test]
    fn test_normalize_min_max_rescales() {
        let mut scores = vec![
            NodeScore {
                name: "a".to_string(),
                score: 10,
            },
            NodeScore {
                name: "b".to_string(),
                score: 30,
            },
            NodeScore {
                name: "c".to_string(),
                score: 20,
            },
        ];
        normalize_min_max(&mut scores);
        assert_eq!(0, scores[0].score);
        assert_eq!(100, scores[1].score);
        assert_eq!(50, scores[2].score);
    }

    #[test]
    fn test_normalize_min_max_collapses_equal_scores() {
        let mut scores = vec![
            NodeScore {
                name: "a".to_string(),
                score: 55,
            },
            NodeScore {
                name: "b".to_string(),
                score: 55,
            },
        ];
        normalize_min_max(&mut scores);
        assert!(scores.iter().all(|s| s.score == MIN_NODE_SCORE));
    }
}
