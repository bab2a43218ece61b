//! Built-in per-kind readiness predicates, keyed by `Kind.group`.

use k8s_openapi::api::apps::v1::{DaemonSetStatus, DaemonSetUpdateStrategy, DeploymentStatus, ReplicaSetStatus, StatefulSetStatus};
use k8s_openapi::api::core::v1::{PodStatus, ReplicationControllerStatus};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// `Err` carries the reason the object is not ready yet.
pub type Predicate = fn(&DynamicObject) -> Result<(), String>;

/// Predicate table. Kinds without an entry are considered ready.
#[derive(Clone)]
pub struct DefaultChecks {
    predicates: FxHashMap<String, Predicate>,
}

impl Default for DefaultChecks {
    fn default() -> Self {
        let mut checks = Self { predicates: FxHashMap::default() };
        checks.register("Pod", check_pod);
        checks.register("Deployment.apps", check_deployment);
        checks.register("ReplicaSet.apps", check_replica_set);
        checks.register("StatefulSet.apps", check_stateful_set);
        checks.register("DaemonSet.apps", check_daemon_set);
        checks.register("ReplicationController", check_replication_controller);
        checks
    }
}

impl DefaultChecks {
    pub fn register(&mut self, group_kind: &str, predicate: Predicate) { self.predicates.insert(group_kind.to_string(), predicate); }

    pub fn get(&self, group_kind: &str) -> Option<Predicate> { self.predicates.get(group_kind).copied() }

    pub fn is_relevant(&self, group_kind: &str) -> bool { self.predicates.contains_key(group_kind) }

    pub fn check(&self, group_kind: &str, obj: &DynamicObject) -> Result<(), String> {
        match self.get(group_kind) {
            Some(p) => p(obj),
            None => Ok(()),
        }
    }
}

fn part<T: DeserializeOwned + Default>(obj: &DynamicObject, pointer: &str) -> Result<T, String> {
    match obj.data.pointer(pointer) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| format!("decoding {}: {}", pointer, e)),
    }
}

fn generation(obj: &DynamicObject) -> i64 { obj.metadata.generation.unwrap_or_default() }

/// `spec.replicas`, defaulting like the API server does.
fn spec_replicas(obj: &DynamicObject, default: i32) -> i32 {
    obj.data.pointer("/spec/replicas").and_then(Value::as_i64).map(|n| n as i32).unwrap_or(default)
}

fn outdated_generation(current: i64, expected: i64) -> String { format!("observed generation outdated ({}/{})", current, expected) }

fn not_enough_ready_replicas(current: i32, expected: i32) -> String { format!("not enough ready replicas ({}/{})", current, expected) }

fn condition_missing(type_: &str) -> String { format!("condition {:?} is missing", type_) }

fn check_condition(type_: &str, expected: &str, actual: &str, reason: Option<&str>, message: Option<&str>) -> Result<(), String> {
    if expected == actual { return Ok(()); }
    Err(format!(
        "condition {:?} has invalid status {} (expected {}) due to {}: {}",
        type_,
        actual,
        expected,
        reason.unwrap_or_default(),
        message.unwrap_or_default()
    ))
}

fn check_observed(obj: &DynamicObject, observed: Option<i64>) -> Result<(), String> {
    let observed = observed.unwrap_or_default();
    if observed < generation(obj) { return Err(outdated_generation(observed, generation(obj))); }
    Ok(())
}

/// Ready condition true, or the pod ran to completion.
pub fn check_pod(obj: &DynamicObject) -> Result<(), String> {
    let status: PodStatus = part(obj, "/status")?;
    let conditions = status.conditions.unwrap_or_default();
    let Some(ready) = conditions.iter().find(|c| c.type_ == "Ready") else { return Err(condition_missing("Ready")) };
    if ready.reason.as_deref() == Some("PodCompleted") { return Ok(()); }
    check_condition("Ready", "True", &ready.status, ready.reason.as_deref(), ready.message.as_deref())
}

pub fn check_deployment(obj: &DynamicObject) -> Result<(), String> {
    let status: DeploymentStatus = part(obj, "/status")?;
    check_observed(obj, status.observed_generation)?;
    let conditions = status.conditions.unwrap_or_default();
    let find = |t: &str| conditions.iter().find(|c| c.type_ == t);

    let available = find("Available").ok_or_else(|| condition_missing("Available"))?;
    check_condition("Available", "True", &available.status, available.reason.as_deref(), available.message.as_deref())?;
    if let Some(c) = find("Progressing") {
        check_condition("Progressing", "True", &c.status, c.reason.as_deref(), c.message.as_deref())?;
    }
    if let Some(c) = find("ReplicaFailure") {
        check_condition("ReplicaFailure", "False", &c.status, c.reason.as_deref(), c.message.as_deref())?;
    }
    Ok(())
}

pub fn check_stateful_set(obj: &DynamicObject) -> Result<(), String> {
    let status: StatefulSetStatus = part(obj, "/status")?;
    check_observed(obj, status.observed_generation)?;
    let replicas = spec_replicas(obj, 1);
    let ready = status.ready_replicas.unwrap_or_default();
    if ready < replicas { return Err(not_enough_ready_replicas(ready, replicas)); }
    Ok(())
}

pub fn check_replica_set(obj: &DynamicObject) -> Result<(), String> {
    let status: ReplicaSetStatus = part(obj, "/status")?;
    check_observed(obj, status.observed_generation)?;
    for c in status.conditions.unwrap_or_default().iter().filter(|c| c.type_ == "ReplicaFailure") {
        check_condition("ReplicaFailure", "False", &c.status, c.reason.as_deref(), c.message.as_deref())?;
    }
    let replicas = spec_replicas(obj, 1);
    let ready = status.ready_replicas.unwrap_or_default();
    if ready < replicas { return Err(not_enough_ready_replicas(ready, replicas)); }
    Ok(())
}

pub fn check_replication_controller(obj: &DynamicObject) -> Result<(), String> {
    let status: ReplicationControllerStatus = part(obj, "/status")?;
    check_observed(obj, status.observed_generation)?;
    for c in status.conditions.unwrap_or_default().iter().filter(|c| c.type_ == "ReplicaFailure") {
        check_condition("ReplicaFailure", "False", &c.status, c.reason.as_deref(), c.message.as_deref())?;
    }
    let replicas = spec_replicas(obj, 1);
    let ready = status.ready_replicas.unwrap_or_default();
    if ready < replicas { return Err(not_enough_ready_replicas(ready, replicas)); }
    Ok(())
}

/// Rolling updates may keep `maxUnavailable` pods down; percentages round down.
fn daemon_set_max_unavailable(strategy: &DaemonSetUpdateStrategy, desired: i32) -> i32 {
    if desired == 0 || strategy.type_.as_deref().unwrap_or("RollingUpdate") != "RollingUpdate" { return 0; }
    let Some(max) = strategy.rolling_update.as_ref().and_then(|r| r.max_unavailable.as_ref()) else { return 0 };
    match max {
        IntOrString::Int(n) => *n,
        IntOrString::String(s) => match s.strip_suffix('%').and_then(|p| p.parse::<i64>().ok()) {
            Some(pct) => (pct * desired as i64 / 100) as i32,
            None => 0,
        },
    }
}

pub fn check_daemon_set(obj: &DynamicObject) -> Result<(), String> {
    let status: DaemonSetStatus = part(obj, "/status")?;
    check_observed(obj, status.observed_generation)?;
    let strategy: DaemonSetUpdateStrategy = part(obj, "/spec/updateStrategy")?;
    let required = status.desired_number_scheduled - daemon_set_max_unavailable(&strategy, status.desired_number_scheduled);
    if status.current_number_scheduled < required {
        return Err(not_enough_ready_replicas(status.current_number_scheduled, required));
    }
    Ok(())
}
