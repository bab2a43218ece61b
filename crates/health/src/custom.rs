//! Declarative readiness checks: JSON-path requirements evaluated against live objects.

use kube::core::DynamicObject;
use rudder_core::{Duration, Labels, ObjectRef, Operator, ValidationErrors};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonpath::{json_eq, JsonPath};

/// Readiness settings of a deployer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessCheckConfiguration {
    /// Skip the built-in per-kind predicates.
    #[serde(default)]
    pub disable_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_readiness_checks: Vec<CustomReadinessCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomReadinessCheck {
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Explicit objects. Only those among the item's managed resources are checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Vec<ObjectRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelectorSpec>,
    #[serde(default)]
    pub requirements: Vec<HealthCheckRequirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorSpec {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub labels: Labels,
}

/// `values` entries are objects of the form `{"value": X}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRequirement {
    pub json_path: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Value>,
}

impl HealthCheckRequirement {
    pub fn new(json_path: &str, operator: Operator, values: impl IntoIterator<Item = Value>) -> Self {
        Self { json_path: json_path.to_string(), operator, values: values.into_iter().map(|v| serde_json::json!({ "value": v })).collect() }
    }

    /// Unwrapped `value` payloads; `Err` names the first entry without one.
    pub fn parsed_values(&self) -> Result<Vec<&Value>, String> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| v.get("value").ok_or_else(|| format!("object at index {} does not contain the value key", i)))
            .collect()
    }

    pub fn validate(&self, field: &str, errs: &mut ValidationErrors) {
        if let Err(e) = self.json_path.parse::<JsonPath>() {
            errs.push(format!("{field}.jsonPath"), e.to_string());
        }
        if let Err(e) = self.parsed_values() {
            errs.push(format!("{field}.values"), e);
        }
        let n = self.values.len();
        match self.operator {
            Operator::Exists | Operator::DoesNotExist if n != 0 => {
                errs.push(format!("{field}.values"), format!("operator {} takes no values", self.operator))
            }
            Operator::NotEquals if n != 1 => errs.push(format!("{field}.values"), format!("operator {} requires exactly one value", self.operator)),
            Operator::Equals | Operator::DoubleEquals if n == 0 => {
                errs.push(format!("{field}.values"), format!("operator {} requires at least one value", self.operator))
            }
            _ => {}
        }
    }

    /// `Ok(None)` when satisfied, `Ok(Some(reason))` when not.
    pub fn evaluate(&self, obj: &Value) -> Result<Option<String>, String> {
        let path: JsonPath = self.json_path.parse().map_err(|e: crate::jsonpath::JsonPathError| e.to_string())?;
        let fields = path.find(obj);
        if fields.is_empty() {
            return Ok(match self.operator {
                Operator::DoesNotExist => None,
                _ => Some(format!("field with JSON path {} does not exist", self.json_path)),
            });
        }
        match self.operator {
            Operator::Exists => return Ok(None),
            Operator::DoesNotExist => return Ok(Some(format!("field with JSON path {} exists", self.json_path))),
            _ => {}
        }
        let values = self.parsed_values()?;
        for field in fields {
            let ok = match self.operator {
                Operator::Equals | Operator::DoubleEquals | Operator::In => values.iter().any(|v| json_eq(field, v)),
                Operator::NotEquals => values.first().map_or(true, |v| !json_eq(field, v)),
                Operator::NotIn => !values.iter().any(|v| json_eq(field, v)),
                Operator::Exists | Operator::DoesNotExist => true,
            };
            if !ok {
                return Ok(Some(format!("resource requirement is not fulfilled for field {}", self.json_path)));
            }
        }
        Ok(None)
    }
}

impl CustomReadinessCheck {
    /// Every requirement must hold. `Ok(Some(reason))` describes the first that does not.
    pub fn check_object(&self, obj: &DynamicObject) -> Result<Option<String>, String> {
        let raw = serde_json::to_value(obj).map_err(|e| e.to_string())?;
        for req in &self.requirements {
            if let Some(reason) = req.evaluate(&raw)? { return Ok(Some(reason)); }
        }
        Ok(None)
    }

    /// Typed references restricted to the managed set.
    pub fn selected_refs(&self, managed: &[ObjectRef]) -> Vec<ObjectRef> {
        let Some(refs) = self.resource.as_ref() else { return Vec::new() };
        refs.iter().filter_map(|r| managed.iter().find(|m| same_target(m, r)).cloned()).collect()
    }

    pub fn validate(&self, field: &str, errs: &mut ValidationErrors) {
        if self.name.is_empty() { errs.push(format!("{field}.name"), "must not be empty"); }
        if self.resource.is_none() && self.label_selector.is_none() {
            errs.push(field, "one of resource or labelSelector must be set");
        }
        if let Some(sel) = &self.label_selector {
            if sel.api_version.is_empty() || sel.kind.is_empty() {
                errs.push(format!("{field}.labelSelector"), "apiVersion and kind must be set");
            }
        }
        for (i, req) in self.requirements.iter().enumerate() {
            req.validate(&format!("{field}.requirements[{i}]"), errs);
        }
    }
}

fn same_target(managed: &ObjectRef, wanted: &ObjectRef) -> bool {
    managed.api_version == wanted.api_version && managed.kind == wanted.kind && managed.name == wanted.name && managed.namespace == wanted.namespace
}

impl ReadinessCheckConfiguration {
    pub fn validate(&self, field: &str) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::default();
        let mut seen = std::collections::BTreeSet::new();
        for (i, c) in self.custom_readiness_checks.iter().enumerate() {
            let f = format!("{field}.customReadinessChecks[{i}]");
            if !c.name.is_empty() && !seen.insert(c.name.as_str()) {
                errs.push(format!("{f}.name"), format!("duplicate check name {:?}", c.name));
            }
            c.validate(&f, &mut errs);
        }
        errs.into_result()
    }
}
