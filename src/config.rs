//! Plan-file decoding, cluster/application directory loading, environment
//! ceilings and log setup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn, LevelFilter};
use serde::{Deserialize, Serialize};

use crate::core::cluster::ResourceTypes;
use crate::core::common::{
    ENV_LOG_LEVEL, ENV_MAX_CPU, ENV_MAX_MEMORY, ENV_MAX_VG, KIND_CONFIG_MAP, KIND_CRON_JOB,
    KIND_DAEMON_SET, KIND_DEPLOYMENT, KIND_JOB, KIND_NODE, KIND_PDB, KIND_POD, KIND_PVC,
    KIND_REPLICATION_CONTROLLER, KIND_REPLICA_SET, KIND_SERVICE, KIND_STATEFUL_SET,
    KIND_STORAGE_CLASS,
};
use crate::core::node::{Node, NodeStorage};
use crate::error::SimonError;

/// The `Simon` custom resource driving the `apply` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimonPlan {
    pub api_version: String,
    pub kind: String,
    pub metadata: PlanMetadata,
    pub spec: PlanSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanSpec {
    pub cluster: ClusterSource,
    pub app_list: Vec<AppInfo>,
    pub new_node: String,
    /// Iteration cap of the capacity search.
    pub max_new_nodes: Option<usize>,
}

/// Exactly one of the two sources must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSource {
    pub kube_config: String,
    pub custom_config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppInfo {
    pub name: String,
    pub path: String,
    pub chart: bool,
}

pub fn load_plan(path: &Path) -> Result<SimonPlan, SimonError> {
    let content = fs::read_to_string(path).map_err(|err| {
        SimonError::InvalidInput(format!("failed to read plan file {:?}: {}", path, err))
    })?;
    let plan: SimonPlan = serde_yaml::from_str(&content)?;
    validate_plan(&plan)?;
    Ok(plan)
}

fn validate_plan(plan: &SimonPlan) -> Result<(), SimonError> {
    let has_kube = !plan.spec.cluster.kube_config.is_empty();
    let has_custom = !plan.spec.cluster.custom_config.is_empty();
    if has_kube == has_custom {
        return Err(SimonError::InvalidInput(
            "exactly one of cluster.kubeConfig and cluster.customConfig must be set".to_string(),
        ));
    }
    if has_custom && !Path::new(&plan.spec.cluster.custom_config).exists() {
        return Err(SimonError::InvalidInput(format!(
            "invalid path of customConfig: {:?}",
            plan.spec.cluster.custom_config
        )));
    }
    if plan.spec.new_node.is_empty() {
        return Err(SimonError::InvalidInput(
            "spec.newNode must point at a node manifest".to_string(),
        ));
    }
    if !Path::new(&plan.spec.new_node).exists() {
        return Err(SimonError::InvalidInput(format!(
            "invalid path of newNode: {:?}",
            plan.spec.new_node
        )));
    }
    for app in &plan.spec.app_list {
        if !Path::new(&app.path).exists() {
            return Err(SimonError::InvalidInput(format!(
                "invalid path of {} app: {:?}",
                app.name, app.path
            )));
        }
    }
    Ok(())
}

/// Global utilization ceilings, percentages clamped to 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtilizationCeilings {
    pub cpu: i64,
    pub memory: i64,
    pub vg: i64,
}

impl Default for UtilizationCeilings {
    fn default() -> Self {
        UtilizationCeilings {
            cpu: 100,
            memory: 100,
            vg: 100,
        }
    }
}

fn ceiling_from_env(name: &str) -> i64 {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<i64>() {
            Ok(value) => value.clamp(0, 100),
            Err(_) => {
                warn!("ignoring unparsable {}={:?}", name, raw);
                100
            }
        },
        Err(_) => 100,
    }
}

impl UtilizationCeilings {
    pub fn from_env() -> Self {
        UtilizationCeilings {
            cpu: ceiling_from_env(ENV_MAX_CPU),
            memory: ceiling_from_env(ENV_MAX_MEMORY),
            vg: ceiling_from_env(ENV_MAX_VG),
        }
    }
}

/// Initializes env_logger honoring the `LogLevel` environment variable
/// (`Panic|Fatal|Error|Warn|Info|Debug|Trace`).
pub fn init_logging() {
    let level = match std::env::var(ENV_LOG_LEVEL).ok().as_deref() {
        Some("Panic") | Some("Fatal") | Some("Error") => LevelFilter::Error,
        Some("Warn") => LevelFilter::Warn,
        Some("Debug") => LevelFilter::Debug,
        Some("Trace") => LevelFilter::Trace,
        Some("Info") | None | Some(_) => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

fn collect_yaml_paths(path: &Path, paths: &mut Vec<PathBuf>) -> Result<(), SimonError> {
    let metadata = fs::metadata(path).map_err(|err| {
        SimonError::InvalidInput(format!("invalid path {:?}: {}", path, err))
    })?;
    if metadata.is_dir() {
        let mut entries: Vec<PathBuf> = fs::read_dir(path)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for entry in entries {
            collect_yaml_paths(&entry, paths)?;
        }
    } else if metadata.is_file() {
        paths.push(path.to_path_buf());
    }
    Ok(())
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn push_object(
    resources: &mut ResourceTypes,
    kind: &str,
    value: serde_yaml::Value,
    path: &Path,
) -> Result<(), SimonError> {
    let invalid = |err: serde_yaml::Error| {
        SimonError::InvalidInput(format!("failed to decode {} in {:?}: {}", kind, path, err))
    };
    match kind {
        KIND_NODE => resources
            .nodes
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_POD => resources
            .pods
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_DEPLOYMENT => resources
            .deployments
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_REPLICA_SET => resources
            .replica_sets
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_REPLICATION_CONTROLLER => resources
            .replication_controllers
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_STATEFUL_SET => resources
            .stateful_sets
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_DAEMON_SET => resources
            .daemon_sets
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_JOB => resources
            .jobs
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_CRON_JOB => resources
            .cron_jobs
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_SERVICE => resources
            .services
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_PVC => resources
            .persistent_volume_claims
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_STORAGE_CLASS => resources
            .storage_classes
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_PDB => resources
            .pod_disruption_budgets
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        KIND_CONFIG_MAP => resources
            .config_maps
            .push(serde_yaml::from_value(value).map_err(invalid)?),
        other => debug!("ignoring unknown kind {:?} in {:?}", other, path),
    }
    Ok(())
}

/// Recursively loads every `*.yaml`/`*.yml` under `path` as a
/// multi-document stream and decodes known kinds; unknown kinds are
/// skipped with a debug log. A node manifest `foo.yaml` may carry a
/// sibling `foo.json` local-storage sidecar, attached as the node's
/// local-storage annotation.
pub fn load_resources_from_path(path: &Path) -> Result<ResourceTypes, SimonError> {
    let mut yaml_paths = vec![];
    collect_yaml_paths(path, &mut yaml_paths)?;

    let mut resources = ResourceTypes::default();
    // node name → file stem, for sidecar matching
    let mut node_sources: BTreeMap<String, PathBuf> = BTreeMap::new();

    for file in yaml_paths.iter().filter(|p| is_yaml(p)) {
        let content = fs::read_to_string(file)?;
        for document in serde_yaml::Deserializer::from_str(&content) {
            let value = serde_yaml::Value::deserialize(document).map_err(|err| {
                SimonError::InvalidInput(format!("malformed YAML in {:?}: {}", file, err))
            })?;
            if value.is_null() {
                continue;
            }
            let kind = value
                .get("kind")
                .and_then(|k| k.as_str())
                .unwrap_or_default()
                .to_string();
            let node_count_before = resources.nodes.len();
            push_object(&mut resources, &kind, value, file)?;
            if resources.nodes.len() > node_count_before {
                let node = resources.nodes.last().unwrap();
                node_sources.insert(node.metadata.name.clone(), file.clone());
            }
        }
    }

    for node in resources.nodes.iter_mut() {
        let source = match node_sources.get(&node.metadata.name) {
            Some(source) => source,
            None => continue,
        };
        let sidecar = source.with_extension("json");
        if !sidecar.exists() {
            continue;
        }
        let raw = fs::read_to_string(&sidecar)?;
        let storage: NodeStorage = serde_json::from_str(&raw).map_err(|err| {
            SimonError::InvalidInput(format!(
                "malformed local-storage sidecar {:?}: {}",
                sidecar, err
            ))
        })?;
        node.set_local_storage(&storage);
        debug!(
            "attached local storage sidecar {:?} to node {}",
            sidecar, node.metadata.name
        );
    }

    Ok(resources)
}

/// Loads a single node manifest (the capacity-search template).
pub fn load_node_file(path: &Path) -> Result<Node, SimonError> {
    let content = fs::read_to_string(path).map_err(|err| {
        SimonError::InvalidInput(format!("failed to read node file {:?}: {}", path, err))
    })?;
    for document in serde_yaml::Deserializer::from_str(&content) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|err| SimonError::InvalidInput(format!("malformed YAML: {}", err)))?;
        if value.get("kind").and_then(|k| k.as_str()) == Some(KIND_NODE) {
            return serde_yaml::from_value(value).map_err(|err| {
                SimonError::InvalidInput(format!("failed to decode node {:?}: {}", path, err))
            });
        }
    }
    Err(SimonError::InvalidInput(format!(
        "the newNode file {:?} is not a Node yaml",
        path
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_deserialization() {
        let yaml = r#"
        apiVersion: simon/v1alpha1
        kind: Simon
        metadata:
          name: test
        spec:
          cluster:
            customConfig: ./cluster
          appList:
          - name: simple
            path: ./apps/simple
          newNode: ./newnode.yaml
        "#;
        let plan: SimonPlan = serde_yaml::from_str(yaml).unwrap();
        assert_eq!("Simon", plan.kind);
        assert_eq!("./cluster", plan.spec.cluster.custom_config);
        assert_eq!(1, plan.spec.app_list.len());
        assert!(!plan.spec.app_list[0].chart);
        assert_eq!(None, plan.spec.max_new_nodes);
    }

    #[test]
    fn test_plan_requires_exactly_one_cluster_source() {
        let both = SimonPlan {
            spec: PlanSpec {
                cluster: ClusterSource {
                    kube_config: "a".to_string(),
                    custom_config: "b".to_string(),
                },
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(validate_plan(&both).is_err());
        let neither = SimonPlan::default();
        assert!(validate_plan(&neither).is_err());
    }
}
