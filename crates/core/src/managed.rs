//! Managed resources and the deletion group definitions that order their teardown.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationErrors;
use crate::store::ObjectRef;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagedResourcePolicy {
    /// Fully owned: created, updated and deleted.
    #[default]
    Manage,
    /// Managed only while it carries our managed-by label.
    Fallback,
    /// Created and updated, never deleted.
    Keep,
    /// Never applied.
    Ignore,
    /// Created once, never updated.
    Immutable,
}

impl ManagedResourcePolicy {
    /// May this resource be removed during teardown or orphan cleanup.
    pub fn deletable(self) -> bool { matches!(self, Self::Manage | Self::Fallback | Self::Immutable) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub resource: ObjectRef,
    #[serde(default)]
    pub policy: ManagedResourcePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotate_before_delete: Option<BTreeMap<String, String>>,
}

impl ManagedResource {
    pub fn new(resource: ObjectRef, policy: ManagedResourcePolicy) -> Self {
        Self { resource, policy, annotate_before_delete: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredefinedGroup {
    NamespacedResources,
    ClusterScopedResources,
    Crds,
    /// Matches nothing.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredefinedResourceGroup {
    #[serde(rename = "type")]
    pub group: PredefinedGroup,
    #[serde(default)]
    pub force_delete: bool,
}

/// Filter for one resource type inside a custom group. Empty `names`/`namespaces` match all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceType {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

impl ResourceType {
    pub fn matches(&self, r: &ObjectRef) -> bool {
        if r.api_version != self.api_version || r.kind != self.kind { return false; }
        if !self.names.is_empty() && !self.names.iter().any(|n| *n == r.name) { return false; }
        if !self.namespaces.is_empty() {
            let ns = r.namespace.as_deref().unwrap_or("");
            if !self.namespaces.iter().any(|n| n == ns) { return false; }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceGroup {
    pub resources: Vec<ResourceType>,
    #[serde(default)]
    pub force_delete: bool,
    /// Delete every matching object in the cluster, not only the ones this item created.
    #[serde(default)]
    pub delete_all_resources: bool,
}

/// Exactly one of the two variants must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionGroupDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predefined_resource_group: Option<PredefinedResourceGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_resource_group: Option<CustomResourceGroup>,
}

impl DeletionGroupDefinition {
    pub fn predefined(group: PredefinedGroup) -> Self {
        Self { predefined_resource_group: Some(PredefinedResourceGroup { group, force_delete: false }), custom_resource_group: None }
    }

    pub fn custom(resources: Vec<ResourceType>, delete_all_resources: bool) -> Self {
        Self {
            predefined_resource_group: None,
            custom_resource_group: Some(CustomResourceGroup { resources, force_delete: false, delete_all_resources }),
        }
    }

    pub fn with_force_delete(mut self) -> Self {
        if let Some(p) = self.predefined_resource_group.as_mut() { p.force_delete = true; }
        if let Some(c) = self.custom_resource_group.as_mut() { c.force_delete = true; }
        self
    }

    pub fn force_delete(&self) -> bool {
        match (&self.predefined_resource_group, &self.custom_resource_group) {
            (Some(p), _) => p.force_delete,
            (_, Some(c)) => c.force_delete,
            _ => false,
        }
    }

    /// Only custom groups may expand to all cluster resources.
    pub fn delete_all_resources(&self) -> bool {
        self.custom_resource_group.as_ref().is_some_and(|c| c.delete_all_resources)
    }

    pub fn is_empty_group(&self) -> bool {
        self.predefined_resource_group.as_ref().is_some_and(|p| p.group == PredefinedGroup::Empty)
    }

    pub fn validate(&self, field: &str) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::default();
        match (&self.predefined_resource_group, &self.custom_resource_group) {
            (Some(_), Some(_)) => errs.push(field, "predefinedResourceGroup and customResourceGroup are mutually exclusive"),
            (None, None) => errs.push(field, "one of predefinedResourceGroup or customResourceGroup must be set"),
            (None, Some(c)) => {
                if c.resources.is_empty() {
                    errs.push(format!("{field}.customResourceGroup.resources"), "must not be empty");
                }
                for (i, r) in c.resources.iter().enumerate() {
                    let f = format!("{field}.customResourceGroup.resources[{i}]");
                    if r.api_version.is_empty() { errs.push(format!("{f}.apiVersion"), "must not be empty"); }
                    if r.kind.is_empty() { errs.push(format!("{f}.kind"), "must not be empty"); }
                }
            }
            (Some(_), None) => {}
        }
        errs.into_result()
    }
}

pub fn validate_deletion_groups(defs: &[DeletionGroupDefinition], field: &str) -> Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::default();
    for (i, d) in defs.iter().enumerate() {
        if let Err(e) = d.validate(&format!("{field}[{i}]")) { errs.extend(e); }
    }
    errs.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TypeRef;

    #[test]
    fn exactly_one_variant_required() {
        assert!(DeletionGroupDefinition::default().validate("g").is_err());
        let mut both = DeletionGroupDefinition::predefined(PredefinedGroup::Crds);
        both.custom_resource_group = Some(CustomResourceGroup { resources: vec![], force_delete: false, delete_all_resources: false });
        let err = both.validate("g").unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
        assert!(DeletionGroupDefinition::predefined(PredefinedGroup::Crds).validate("g").is_ok());
        assert!(DeletionGroupDefinition::custom(vec![], false).validate("g").is_err());
    }

    #[test]
    fn delete_all_only_for_custom_groups() {
        let rt = ResourceType { api_version: "v1".into(), kind: "ConfigMap".into(), names: vec![], namespaces: vec![] };
        assert!(DeletionGroupDefinition::custom(vec![rt], true).delete_all_resources());
        assert!(!DeletionGroupDefinition::predefined(PredefinedGroup::NamespacedResources).delete_all_resources());
        assert!(DeletionGroupDefinition::predefined(PredefinedGroup::Crds).with_force_delete().force_delete());
    }

    #[test]
    fn resource_type_filters_names_and_namespaces() {
        let rt = ResourceType { api_version: "v1".into(), kind: "ConfigMap".into(), names: vec!["a".into()], namespaces: vec!["ns1".into()] };
        let t = TypeRef::new("v1", "ConfigMap");
        assert!(rt.matches(&ObjectRef::new(&t, Some("ns1"), "a")));
        assert!(!rt.matches(&ObjectRef::new(&t, Some("ns2"), "a")));
        assert!(!rt.matches(&ObjectRef::new(&t, Some("ns1"), "b")));
        assert!(!rt.matches(&ObjectRef::new(&TypeRef::new("v1", "Secret"), Some("ns1"), "a")));
    }

    #[test]
    fn wire_format() {
        let v = serde_json::json!({"predefinedResourceGroup": {"type": "cluster-scoped-resources", "forceDelete": true}});
        let d: DeletionGroupDefinition = serde_json::from_value(v).unwrap();
        assert_eq!(d.predefined_resource_group.as_ref().unwrap().group, PredefinedGroup::ClusterScopedResources);
        assert!(d.force_delete());
        assert_eq!(serde_json::to_value(ManagedResourcePolicy::Immutable).unwrap(), "immutable");
    }
}
