use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::duration::Duration;
use crate::error::LsError;
use crate::store::StoreObject;
use crate::{annotations, meta, API_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Progressing,
    Succeeded,
    Failed,
    InitDelete,
    Deleting,
    DeleteFailed,
}

impl Phase {
    pub fn is_final(self) -> bool { matches!(self, Phase::Succeeded | Phase::Failed | Phase::DeleteFailed) }

    pub fn is_deleting(self) -> bool { matches!(self, Phase::InitDelete | Phase::Deleting | Phase::DeleteFailed) }

    pub fn failed_variant(self) -> Phase { if self.is_deleting() { Phase::DeleteFailed } else { Phase::Failed } }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "Init",
            Phase::Progressing => "Progressing",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::InitDelete => "InitDelete",
            Phase::Deleting => "Deleting",
            Phase::DeleteFailed => "DeleteFailed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Values of the `rudder.dev/operation` annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Reconcile,
    ForceReconcile,
    Abort,
    TestReconcile,
}

impl FromStr for Operation {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconcile" => Ok(Operation::Reconcile),
            "force-reconcile" => Ok(Operation::ForceReconcile),
            "abort" => Ok(Operation::Abort),
            "test-reconcile" => Ok(Operation::TestReconcile),
            other => Err(format!("unknown operation {other:?}")),
        }
    }
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Reconcile => "reconcile",
            Operation::ForceReconcile => "force-reconcile",
            Operation::Abort => "abort",
            Operation::TestReconcile => "test-reconcile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployItemSpec {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetRef>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub configuration: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub update_on_change_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionTimes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_time: Option<DateTime<Utc>>,
}

/// Identity of the controller instance that last processed an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployerInformation {
    pub identity: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployItemStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, rename = "jobID", skip_serializing_if = "String::is_empty")]
    pub job_id: String,
    #[serde(default, rename = "jobIDFinished", skip_serializing_if = "String::is_empty")]
    pub job_id_finished: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LsError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_times: Option<TransitionTimes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployer: Option<DeployerInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
}

/// The unit of work driven by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployItem {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: DeployItemSpec,
    #[serde(default)]
    pub status: DeployItemStatus,
}

impl StoreObject for DeployItem {
    const API_VERSION: &'static str = API_VERSION;
    const KIND: &'static str = "DeployItem";
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}

impl DeployItem {
    pub fn new(namespace: &str, name: &str, type_: &str) -> Self {
        let metadata = ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), ..Default::default() };
        Self { metadata, spec: DeployItemSpec { type_: type_.to_string(), ..Default::default() }, status: Default::default() }
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or_default() }
    pub fn namespace(&self) -> &str { self.metadata.namespace.as_deref().unwrap_or_default() }
    pub fn uid(&self) -> &str { self.metadata.uid.as_deref().unwrap_or_default() }
    pub fn key(&self) -> String { meta::key(&self.metadata) }
    pub fn generation(&self) -> i64 { self.metadata.generation.unwrap_or_default() }

    pub fn is_deleting(&self) -> bool { self.metadata.deletion_timestamp.is_some() }

    /// Final phase and no pending job.
    pub fn is_finished(&self) -> bool {
        self.status.phase.is_some_and(Phase::is_final) && self.status.job_id == self.status.job_id_finished
    }

    /// A new job was requested while the item sits in a final (or empty) phase.
    pub fn has_new_job(&self) -> bool {
        self.status.job_id != self.status.job_id_finished && self.status.phase.map_or(true, Phase::is_final)
    }

    pub fn operation(&self) -> Option<Operation> {
        meta::annotation(&self.metadata, annotations::OPERATION).and_then(|s| s.parse().ok())
    }

    pub fn delete_without_uninstall(&self) -> bool {
        meta::annotation(&self.metadata, annotations::DELETE_WITHOUT_UNINSTALL).is_some_and(|v| v == "true")
    }

    pub fn init_time(&self) -> Option<DateTime<Utc>> {
        self.status.transition_times.as_ref().and_then(|t| t.init_time)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub configuration: serde_json::Value,
}

/// A destination environment. Annotations drive target selectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TargetSpec,
}

impl StoreObject for Target {
    const API_VERSION: &'static str = API_VERSION;
    const KIND: &'static str = "Target";
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}

impl Target {
    pub const KUBERNETES_CLUSTER: &'static str = "rudder.dev/kubernetes-cluster";

    pub fn kubeconfig(&self) -> Option<&str> {
        self.spec.configuration.get("kubeconfig").and_then(|v| v.as_str())
    }
}

/// A target together with its materialized connection content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedTarget {
    pub target: Target,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncObjectSpec {
    /// Identity of the controller replica holding the lock. Empty means free.
    #[serde(default)]
    pub holder: String,
    pub kind: String,
    pub name: String,
    pub last_update_time: DateTime<Utc>,
}

/// Cluster-visible lock record for one deploy item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: SyncObjectSpec,
}

impl StoreObject for SyncObject {
    const API_VERSION: &'static str = API_VERSION;
    const KIND: &'static str = "SyncObject";
    fn meta(&self) -> &ObjectMeta { &self.metadata }
    fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
}

impl SyncObject {
    pub fn name_for(uid: &str) -> String { format!("di-{uid}") }
    pub fn is_free(&self) -> bool { self.spec.holder.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_phases() {
        assert!(Phase::Succeeded.is_final());
        assert!(Phase::Failed.is_final());
        assert!(Phase::DeleteFailed.is_final());
        assert!(!Phase::Deleting.is_final());
        assert_eq!(Phase::InitDelete.failed_variant(), Phase::DeleteFailed);
        assert_eq!(Phase::Init.failed_variant(), Phase::Failed);
    }

    #[test]
    fn new_job_detection() {
        let mut di = DeployItem::new("ns", "a", "manifest");
        di.status.job_id = "1".into();
        assert!(di.has_new_job(), "empty phase with pending job");
        di.status.phase = Some(Phase::Progressing);
        assert!(!di.has_new_job());
        di.status.phase = Some(Phase::Succeeded);
        di.status.job_id_finished = "1".into();
        assert!(di.is_finished());
        assert!(!di.has_new_job());
        di.status.job_id = "2".into();
        assert!(di.has_new_job());
        assert!(!di.is_finished());
    }

    #[test]
    fn status_uses_wire_names() {
        let mut di = DeployItem::new("ns", "a", "manifest");
        di.spec.timeout = Some(Duration::from_secs(120));
        di.status.job_id = "j".into();
        let v = serde_json::to_value(&di).unwrap();
        assert_eq!(v["spec"]["type"], "manifest");
        assert_eq!(v["spec"]["timeout"], "2m");
        assert_eq!(v["status"]["jobID"], "j");
        let back: DeployItem = serde_json::from_value(v).unwrap();
        assert_eq!(back, di);
    }

    #[test]
    fn operation_annotation_parses() {
        let mut di = DeployItem::new("ns", "a", "manifest");
        meta::set_annotation(&mut di.metadata, annotations::OPERATION, "force-reconcile");
        assert_eq!(di.operation(), Some(Operation::ForceReconcile));
        meta::set_annotation(&mut di.metadata, annotations::OPERATION, "bogus");
        assert_eq!(di.operation(), None);
    }
}
