//! Label-selector, node-affinity and taint-toleration evaluation, shared by
//! the scheduler predicates and the daemon-set expansion.

use std::collections::BTreeMap;

use crate::core::common::{TAINT_EFFECT_NO_EXECUTE, TAINT_EFFECT_NO_SCHEDULE};
use crate::core::node::{Node, Taint};
use crate::core::pod::{
    LabelSelector, LabelSelectorOperator, NodeSelectorOperator, NodeSelectorTerm, Pod, Toleration,
    TolerationOperator,
};

pub fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    for (key, value) in &selector.match_labels {
        if labels.get(key) != Some(value) {
            return false;
        }
    }
    for requirement in &selector.match_expressions {
        let actual = labels.get(&requirement.key);
        let ok = match requirement.operator {
            LabelSelectorOperator::In => {
                matches!(actual, Some(v) if requirement.values.contains(v))
            }
            LabelSelectorOperator::NotIn => {
                !matches!(actual, Some(v) if requirement.values.contains(v))
            }
            LabelSelectorOperator::Exists => actual.is_some(),
            LabelSelectorOperator::DoesNotExist => actual.is_none(),
        };
        if !ok {
            return false;
        }
    }
    true
}

fn node_selector_term_matches(term: &NodeSelectorTerm, labels: &BTreeMap<String, String>) -> bool {
    term.match_expressions.iter().all(|requirement| {
        let actual = labels.get(&requirement.key);
        match requirement.operator {
            NodeSelectorOperator::In => {
                matches!(actual, Some(v) if requirement.values.contains(v))
            }
            NodeSelectorOperator::NotIn => {
                !matches!(actual, Some(v) if requirement.values.contains(v))
            }
            NodeSelectorOperator::Exists => actual.is_some(),
            NodeSelectorOperator::DoesNotExist => actual.is_none(),
            NodeSelectorOperator::Gt => cmp_numeric(actual, &requirement.values)
                .map_or(false, |ord| ord == std::cmp::Ordering::Greater),
            NodeSelectorOperator::Lt => cmp_numeric(actual, &requirement.values)
                .map_or(false, |ord| ord == std::cmp::Ordering::Less),
        }
    })
}

fn cmp_numeric(actual: Option<&String>, values: &[String]) -> Option<std::cmp::Ordering> {
    let lhs: i64 = actual?.parse().ok()?;
    let rhs: i64 = values.first()?.parse().ok()?;
    Some(lhs.cmp(&rhs))
}

/// Node selector map plus required node-affinity terms. Terms are ORed,
/// requirements within a term are ANDed.
pub fn pod_matches_node_affinity(pod: &Pod, node: &Node) -> bool {
    for (key, value) in &pod.spec.node_selector {
        if node.metadata.labels.get(key) != Some(value) {
            return false;
        }
    }
    let required = pod
        .spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required.as_ref());
    match required {
        Some(selector) if !selector.node_selector_terms.is_empty() => selector
            .node_selector_terms
            .iter()
            .any(|term| node_selector_term_matches(term, &node.metadata.labels)),
        _ => true,
    }
}

pub fn toleration_tolerates_taint(toleration: &Toleration, taint: &Taint) -> bool {
    if !toleration.effect.is_empty() && toleration.effect != taint.effect {
        return false;
    }
    match toleration.operator {
        TolerationOperator::Exists => {
            toleration.key.is_empty() || toleration.key == taint.key
        }
        TolerationOperator::Equal => {
            toleration.key == taint.key && toleration.value == taint.value
        }
    }
}

/// Returns the first scheduling-relevant taint the pod does not tolerate.
pub fn find_untolerated_taint<'a>(pod: &Pod, taints: &'a [Taint]) -> Option<&'a Taint> {
    taints
        .iter()
        .filter(|t| t.effect == TAINT_EFFECT_NO_SCHEDULE || t.effect == TAINT_EFFECT_NO_EXECUTE)
        .find(|taint| {
            !pod.spec
                .tolerations
                .iter()
                .any(|toleration| toleration_tolerates_taint(toleration, taint))
        })
}

pub fn pod_tolerates_all_taints(pod: &Pod, taints: &[Taint]) -> bool {
    find_untolerated_taint(pod, taints).is_none()
}

pub fn pod_fits_node_name(pod: &Pod, node: &Node) -> bool {
    pod.spec.node_name.is_empty() || pod.spec.node_name == node.metadata.name
}

/// The daemon-set predicate: `fitsNodeName ∧ fitsNodeAffinity ∧ toleratesAllTaints`.
pub fn node_should_run_pod(node: &Node, pod: &Pod) -> bool {
    pod_fits_node_name(pod, node)
        && pod_matches_node_affinity(pod, node)
        && pod_tolerates_all_taints(pod, &node.spec.taints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::common::{LABEL_MASTER_ROLE, TAINT_EFFECT_NO_SCHEDULE};
    use crate::core::pod::{Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement};

    fn master_node() -> Node {
        let mut node = Node::default();
        node.metadata.name = "master-1".to_string();
        node.metadata.set_label(LABEL_MASTER_ROLE, "");
        node.spec.taints.push(Taint {
            key: LABEL_MASTER_ROLE.to_string(),
            value: String::new(),
            effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
        });
        node
    }

    fn pod_with_required_affinity(operator: NodeSelectorOperator) -> Pod {
        let mut pod = Pod::default();
        pod.spec.affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: vec![NodeSelectorRequirement {
                            key: LABEL_MASTER_ROLE.to_string(),
                            operator,
                            values: vec![],
                        }],
                    }],
                }),
            }),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn test_node_affinity_exists_operator() {
        let node = master_node();
        assert!(pod_matches_node_affinity(
            &pod_with_required_affinity(NodeSelectorOperator::Exists),
            &node
        ));
        assert!(!pod_matches_node_affinity(
            &pod_with_required_affinity(NodeSelectorOperator::DoesNotExist),
            &node
        ));
    }

    #[test]
    fn test_node_selector_map() {
        let node = master_node();
        let mut pod = Pod::default();
        pod.spec
            .node_selector
            .insert(LABEL_MASTER_ROLE.to_string(), String::new());
        assert!(pod_matches_node_affinity(&pod, &node));
        pod.spec
            .node_selector
            .insert("missing".to_string(), "x".to_string());
        assert!(!pod_matches_node_affinity(&pod, &node));
    }

    #[test]
    fn test_toleration_matching() {
        let node = master_node();
        let mut pod = Pod::default();
        assert!(!pod_tolerates_all_taints(&pod, &node.spec.taints));

        pod.spec.tolerations.push(Toleration {
            key: LABEL_MASTER_ROLE.to_string(),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
        });
        assert!(pod_tolerates_all_taints(&pod, &node.spec.taints));
    }

    #[test]
    fn test_tolerate_everything_operator() {
        let node = master_node();
        let mut pod = Pod::default();
        // empty key with Exists tolerates every taint
        pod.spec.tolerations.push(Toleration {
            operator: TolerationOperator::Exists,
            ..Default::default()
        });
        assert!(pod_tolerates_all_taints(&pod, &node.spec.taints));
    }

    #[test]
    fn test_daemon_set_predicate() {
        let node = master_node();
        let mut pod = pod_with_required_affinity(NodeSelectorOperator::Exists);
        // affinity matches but the master taint is not tolerated
        assert!(!node_should_run_pod(&node, &pod));
        pod.spec.tolerations.push(Toleration {
            operator: TolerationOperator::Exists,
            ..Default::default()
        });
        assert!(node_should_run_pod(&node, &pod));
        pod.spec.node_name = "other".to_string();
        assert!(!node_should_run_pod(&node, &pod));
    }
}
