//! Which deploy items this controller instance is responsible for.

use rudder_core::{meta, DeployItem, Operator, Target, TargetRef, ValidationErrors};
use serde::{Deserialize, Serialize};

/// One annotation requirement evaluated against the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Requirement {
    pub fn new(key: impl Into<String>, operator: Operator, values: Vec<String>) -> Self { Self { key: key.into(), operator, values } }

    pub fn matches(&self, target: &Target) -> bool {
        self.operator.matches_str(meta::annotation(&target.metadata, &self.key), &self.values)
    }
}

/// Matches targets by reference and by annotations. Both parts must hold; an empty part matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Requirement>,
}

impl TargetSelector {
    pub fn matches(&self, target: &Target) -> bool {
        let name = target.metadata.name.as_deref().unwrap_or_default();
        let ns = target.metadata.namespace.as_deref();
        let by_ref = self.targets.is_empty()
            || self.targets.iter().any(|r| r.name == name && (r.namespace.is_none() || r.namespace.as_deref() == ns));
        by_ref && self.annotations.iter().all(|r| r.matches(target))
    }

    pub fn validate(&self, field: &str) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::default();
        for (i, t) in self.targets.iter().enumerate() {
            if t.name.is_empty() { errs.push(format!("{field}.targets[{i}].name"), "must not be empty"); }
        }
        for (i, r) in self.annotations.iter().enumerate() {
            let f = format!("{field}.annotations[{i}]");
            if r.key.is_empty() { errs.push(format!("{f}.key"), "must not be empty"); }
            match r.operator {
                Operator::Exists | Operator::DoesNotExist if !r.values.is_empty() => {
                    errs.push(format!("{f}.values"), format!("operator {} takes no values", r.operator))
                }
                Operator::Equals | Operator::DoubleEquals | Operator::NotEquals if r.values.len() != 1 => {
                    errs.push(format!("{f}.values"), format!("operator {} needs exactly one value", r.operator))
                }
                _ => {}
            }
        }
        errs.into_result()
    }
}

/// Every selector must match. No selectors, or no target, means responsible.
pub fn matches_all(selectors: &[TargetSelector], target: Option<&Target>) -> bool {
    match target {
        None => true,
        Some(t) => selectors.iter().all(|s| s.matches(t)),
    }
}

/// Cheap check on metadata only: a mirrored deployer-type annotation for another type rules the item out.
pub fn type_annotation_mismatch(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta, deployer_type: &str) -> bool {
    meta::annotation(meta, rudder_core::annotations::DEPLOYER_TYPE).is_some_and(|t| t != deployer_type)
}

pub fn type_matches(item: &DeployItem, deployer_type: &str) -> bool { item.spec.type_ == deployer_type }

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn target(name: &str, annotations: &[(&str, &str)]) -> Target {
        let mut t = Target { metadata: ObjectMeta { name: Some(name.into()), namespace: Some("default".into()), ..Default::default() }, ..Default::default() };
        for (k, v) in annotations { meta::set_annotation(&mut t.metadata, k, v); }
        t
    }

    #[test]
    fn annotation_requirements_all_hold() {
        let sel = TargetSelector {
            targets: vec![],
            annotations: vec![
                Requirement::new("env", Operator::In, vec!["prod".into(), "stage".into()]),
                Requirement::new("paused", Operator::DoesNotExist, vec![]),
            ],
        };
        assert!(sel.matches(&target("a", &[("env", "prod")])));
        assert!(!sel.matches(&target("a", &[("env", "prod"), ("paused", "true")])));
        assert!(!sel.matches(&target("a", &[("env", "dev")])));
    }

    #[test]
    fn target_refs_restrict_by_name() {
        let sel = TargetSelector { targets: vec![TargetRef { name: "a".into(), namespace: None }], annotations: vec![] };
        assert!(sel.matches(&target("a", &[])));
        assert!(!sel.matches(&target("b", &[])));
    }

    #[test]
    fn every_selector_must_match() {
        let env = TargetSelector { annotations: vec![Requirement::new("env", Operator::Equals, vec!["prod".into()])], ..Default::default() };
        let team = TargetSelector { annotations: vec![Requirement::new("team", Operator::Exists, vec![])], ..Default::default() };
        let t = target("a", &[("env", "prod")]);
        assert!(matches_all(&[env.clone()], Some(&t)));
        assert!(!matches_all(&[env, team], Some(&t)));
        assert!(matches_all(&[], Some(&t)));
        assert!(matches_all(&[TargetSelector::default()], None));
    }

    #[test]
    fn validation_checks_operator_arity() {
        let sel = TargetSelector {
            targets: vec![TargetRef { name: String::new(), namespace: None }],
            annotations: vec![
                Requirement::new("a", Operator::Exists, vec!["x".into()]),
                Requirement::new("b", Operator::NotEquals, vec!["x".into(), "y".into()]),
                Requirement::new("c", Operator::NotIn, vec![]),
            ],
        };
        let errs = sel.validate("sel").unwrap_err();
        assert_eq!(errs.0.len(), 3, "{errs}");
    }
}
