//! Manifest deployer configuration, carried in `DeployItem.spec.configuration`.

use std::collections::BTreeMap;

use rudder_core::managed::validate_deletion_groups;
use rudder_core::{DeletionGroupDefinition, DeployItem, ErrorCode, LsError, ManagedResource, ManagedResourcePolicy, ValidationErrors};
use rudder_health::ReadinessCheckConfiguration;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const OPERATION: &str = "ManifestConfiguration";

fn max_yaml_bytes() -> usize {
    std::env::var("RUDDER_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("RUDDER_MAX_YAML_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateStrategy {
    /// Replace the live object with the manifest.
    #[default]
    Update,
    /// Add missing fields, keep whatever is set live.
    Merge,
    /// Deep-merge the manifest over the live object.
    MergeOverwrite,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub policy: ManagedResourcePolicy,
    pub manifest: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotate_before_create: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotate_before_delete: Option<BTreeMap<String, String>>,
}

impl Manifest {
    pub fn new(manifest: Json) -> Self { Self { manifest, ..Default::default() } }

    fn str_at(&self, path: &[&str]) -> Option<&str> {
        path.iter().try_fold(&self.manifest, |v, k| v.get(*k)).and_then(Json::as_str)
    }

    pub fn api_version(&self) -> Option<&str> { self.str_at(&["apiVersion"]) }
    pub fn kind(&self) -> Option<&str> { self.str_at(&["kind"]) }
    pub fn name(&self) -> Option<&str> { self.str_at(&["metadata", "name"]) }
    pub fn namespace(&self) -> Option<&str> { self.str_at(&["metadata", "namespace"]).filter(|s| !s.is_empty()) }

    fn validate(&self, field: &str, errs: &mut ValidationErrors) {
        if !self.manifest.is_object() {
            errs.push(format!("{field}.manifest"), "must be an object");
            return;
        }
        if self.api_version().is_none() { errs.push(format!("{field}.manifest.apiVersion"), "missing apiVersion"); }
        if self.kind().is_none() { errs.push(format!("{field}.manifest.kind"), "missing kind"); }
        if self.name().is_none() { errs.push(format!("{field}.manifest.metadata.name"), "missing metadata.name"); }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfiguration {
    #[serde(default)]
    pub manifests: Vec<Manifest>,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    #[serde(default)]
    pub readiness_checks: ReadinessCheckConfiguration,
    /// Order for uninstalling; empty means namespaced, cluster-scoped, CRDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletion_groups: Vec<DeletionGroupDefinition>,
    /// Order for removing resources that dropped out of the manifest list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletion_groups_during_update: Vec<DeletionGroupDefinition>,
}

fn configuration_error(reason: &str, message: impl Into<String>) -> LsError {
    LsError::new(OPERATION, reason, message).with_code(ErrorCode::ConfigurationProblem)
}

impl ManifestConfiguration {
    pub fn from_item(item: &DeployItem) -> Result<Self, LsError> {
        if item.spec.configuration.is_null() { return Ok(Self::default()); }
        let cfg: Self = serde_json::from_value(item.spec.configuration.clone())
            .map_err(|e| configuration_error("DecodeConfiguration", format!("deploy item {}: {}", item.key(), e)))?;
        cfg.validate().map_err(|e| configuration_error("InvalidConfiguration", e.to_string()))?;
        Ok(cfg)
    }

    /// Parse a YAML document, rejecting oversized or overly complex payloads.
    pub fn from_yaml(yaml: &str) -> Result<Self, LsError> {
        if yaml.len() > max_yaml_bytes() {
            return Err(configuration_error("PayloadTooLarge", format!("YAML payload too large (>{} bytes)", max_yaml_bytes())));
        }
        let val: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| configuration_error("ParseYaml", format!("parsing YAML: {}", e)))?;
        let json = serde_json::to_value(val).map_err(|e| configuration_error("ParseYaml", format!("converting YAML to JSON: {}", e)))?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(configuration_error("PayloadTooComplex", format!("YAML document too complex (>{} nodes)", max_yaml_nodes())));
        }
        serde_json::from_value(json).map_err(|e| configuration_error("DecodeConfiguration", e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::default();
        for (i, m) in self.manifests.iter().enumerate() {
            m.validate(&format!("manifests[{i}]"), &mut errs);
        }
        if let Err(e) = self.readiness_checks.validate("readinessChecks") { errs.extend(e); }
        if let Err(e) = validate_deletion_groups(&self.deletion_groups, "deletionGroups") { errs.extend(e); }
        if let Err(e) = validate_deletion_groups(&self.deletion_groups_during_update, "deletionGroupsDuringUpdate") { errs.extend(e); }
        errs.into_result()
    }
}

/// What the deployer leaves in `status.providerStatus`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(default)]
    pub managed_resources: Vec<ManagedResource>,
}

impl ProviderStatus {
    /// Empty when nothing was recorded yet.
    pub fn from_item(item: &DeployItem) -> Result<Self, LsError> {
        match &item.status.provider_status {
            None => Ok(Self::default()),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| LsError::internal("ProviderStatus", "DecodeProviderStatus", format!("deploy item {}: {}", item.key(), e))),
        }
    }

    pub fn to_value(&self) -> Json { serde_json::to_value(self).unwrap_or(Json::Null) }
}
