//! Workload templates and the opaque cluster objects the simulator passes
//! through to the fake cluster store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::common::ObjectMeta;
use crate::core::pod::{LabelSelector, PodSpec};
use crate::core::resources::{parse_bytes, Quantity};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodTemplateSpec {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deployment {
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSpec {
    pub replicas: Option<i32>,
    pub selector: Option<LabelSelector>,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSet {
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationController {
    pub metadata: ObjectMeta,
    pub spec: DeploymentSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatefulSet {
    pub metadata: ObjectMeta,
    pub spec: StatefulSetSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatefulSetSpec {
    pub replicas: Option<i32>,
    pub selector: Option<LabelSelector>,
    pub service_name: String,
    pub template: PodTemplateSpec,
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSet {
    pub metadata: ObjectMeta,
    pub spec: DaemonSetSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSetSpec {
    pub selector: Option<LabelSelector>,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub completions: Option<i32>,
    pub parallelism: Option<i32>,
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronJob {
    pub metadata: ObjectMeta,
    pub spec: CronJobSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronJobSpec {
    pub schedule: String,
    pub job_template: JobTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTemplateSpec {
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentVolumeClaim {
    pub metadata: ObjectMeta,
    pub spec: PvcSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PvcSpec {
    pub storage_class_name: Option<String>,
    pub access_modes: Vec<String>,
    pub resources: PvcResourceRequirements,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvcResourceRequirements {
    pub requests: BTreeMap<String, Quantity>,
}

impl PersistentVolumeClaim {
    /// Requested storage in bytes, zero when absent or unparsable.
    pub fn storage_bytes(&self) -> i64 {
        self.spec
            .resources
            .requests
            .get("storage")
            .and_then(|q| parse_bytes(q).ok())
            .unwrap_or(0)
    }
}

// Opaque pass-through objects: the simulator only needs their identity.

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub metadata: ObjectMeta,
    pub spec: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageClass {
    pub metadata: ObjectMeta,
    pub provisioner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodDisruptionBudget {
    pub metadata: ObjectMeta,
    pub spec: serde_yaml::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_deployment_manifest() {
        let yaml = r#"
        metadata:
          name: busybox-deploy
          namespace: simple
        spec:
          replicas: 4
          template:
            metadata:
              labels:
                app: busybox
            spec:
              containers:
              - name: main
                image: busybox
                resources:
                  requests:
                    cpu: 1500m
                    memory: 1Gi
        "#;
        let deploy: Deployment = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(Some(4), deploy.spec.replicas);
        assert_eq!(
            "busybox",
            deploy.spec.template.metadata.labels.get("app").unwrap()
        );
    }

    #[test]
    fn test_pvc_storage_bytes() {
        let yaml = r#"
        metadata:
          name: data
        spec:
          storageClassName: open-local-lvm
          resources:
            requests:
              storage: 10Gi
        "#;
        let pvc: PersistentVolumeClaim = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(10 * 1024 * 1024 * 1024, pvc.storage_bytes());
        assert_eq!(
            Some("open-local-lvm".to_string()),
            pvc.spec.storage_class_name
        );
    }
}
