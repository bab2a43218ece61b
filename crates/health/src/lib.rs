//! Rudder health: readiness checks over managed resources.
//!
//! Two kinds of checks share one poll loop ([`wait_for_objects_healthy`]): the built-in
//! per-kind predicates ([`DefaultChecks`]) and declarative JSON-path requirements
//! ([`CustomReadinessCheck`]). A missing object is "not ready yet"; any other read
//! failure stops the wait.

#![forbid(unsafe_code)]

pub mod custom;
pub mod jsonpath;
pub mod predicates;
pub mod wait;

use std::time::Duration as StdDuration;

use futures::future::join_all;
use kube::core::DynamicObject;
use rudder_core::interruption::InterruptionChecker;
use rudder_core::{ClusterStore, ErrorCode, LsError, ObjectRef, TypeRef};
use tracing::{debug, info};

pub use custom::{CustomReadinessCheck, HealthCheckRequirement, LabelSelectorSpec, ReadinessCheckConfiguration};
pub use jsonpath::{JsonPath, JsonPathError};
pub use predicates::{DefaultChecks, Predicate};
pub use wait::{wait_for_objects_healthy, WaitOptions, DEFAULT_POLL_INTERVAL};

/// Everything a readiness check needs besides the objects it looks at.
pub struct HealthContext<'a> {
    pub store: &'a dyn ClusterStore,
    pub interruption: &'a dyn InterruptionChecker,
    pub checks: &'a DefaultChecks,
    pub operation: String,
    pub interval: StdDuration,
}

impl<'a> HealthContext<'a> {
    pub fn new(store: &'a dyn ClusterStore, interruption: &'a dyn InterruptionChecker, checks: &'a DefaultChecks, operation: impl Into<String>) -> Self {
        Self { store, interruption, checks, operation: operation.into(), interval: DEFAULT_POLL_INTERVAL }
    }

    pub fn with_interval(mut self, interval: StdDuration) -> Self {
        self.interval = interval;
        self
    }

    fn options(&self, timeout: StdDuration) -> WaitOptions { WaitOptions::new(self.operation.clone(), timeout).with_interval(self.interval) }

    /// `Ok(None)` when the object is gone.
    async fn fetch(&self, r: &ObjectRef) -> Result<Option<DynamicObject>, LsError> {
        match self.store.get(&r.type_ref(), r.namespace(), &r.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(LsError::wrap(self.operation.clone(), "GetObject", format!("unable to get {}: {}", r, e))),
        }
    }
}

/// Pending reasons of one poll round; the first hard error wins.
fn pending(results: Vec<Result<Option<String>, LsError>>) -> Result<Vec<String>, LsError> {
    let mut out = Vec::new();
    for r in results {
        if let Some(reason) = r? { out.push(reason); }
    }
    Ok(out)
}

/// Wait until every managed object of a kind with a built-in predicate passes it.
pub async fn check_default_readiness(ctx: &HealthContext<'_>, managed: &[ObjectRef], timeout: StdDuration) -> Result<(), LsError> {
    let relevant: Vec<&ObjectRef> = managed.iter().filter(|r| ctx.checks.is_relevant(&r.type_ref().group_kind())).collect();
    if relevant.is_empty() { return Ok(()); }
    info!(op = %ctx.operation, objects = relevant.len(), timeout_s = timeout.as_secs(), "default readiness check");
    let relevant = &relevant[..];
    wait_for_objects_healthy(&ctx.options(timeout), ctx.interruption, move || async move {
        let results = join_all(relevant.iter().map(|r| async move {
            let Some(obj) = ctx.fetch(r).await? else { return Ok(Some(format!("{} not found", r))) };
            Ok::<_, LsError>(ctx.checks.check(&r.type_ref().group_kind(), &obj).err().map(|reason| format!("{} is not ready: {}", r, reason)))
        }))
        .await;
        pending(results)
    })
    .await
}

async fn select_by_labels(ctx: &HealthContext<'_>, check: &CustomReadinessCheck, managed: &[ObjectRef]) -> Result<Result<Vec<DynamicObject>, String>, LsError> {
    let Some(sel) = check.label_selector.as_ref() else { return Ok(Ok(Vec::new())) };
    let type_ref = TypeRef::new(sel.api_version.clone(), sel.kind.clone());
    let listed = ctx
        .store
        .list(&type_ref, None, Some(&sel.labels))
        .await
        .map_err(|e| LsError::wrap(ctx.operation.clone(), "ListObjects", format!("unable to list {}: {}", type_ref, e)))?;
    let selected: Vec<DynamicObject> = listed
        .into_iter()
        .filter(|o| ObjectRef::from_object(o).is_ok_and(|r| managed.iter().any(|m| m.type_ref() == r.type_ref() && m.namespace == r.namespace && m.name == r.name)))
        .collect();
    if selected.is_empty() {
        return Ok(Err(format!("{}: object list by label selector is empty", type_ref)));
    }
    Ok(Ok(selected))
}

/// Wait until every object selected by `check` satisfies all of its requirements.
pub async fn check_custom_readiness(ctx: &HealthContext<'_>, managed: &[ObjectRef], check: &CustomReadinessCheck, timeout: StdDuration) -> Result<(), LsError> {
    if check.disabled {
        debug!(op = %ctx.operation, check = %check.name, "custom readiness check disabled");
        return Ok(());
    }
    let timeout = check.timeout.map(|d| d.as_std()).unwrap_or(timeout);
    let refs = check.selected_refs(managed);
    info!(op = %ctx.operation, check = %check.name, objects = refs.len(), "custom readiness check");
    let evaluate = |obj: &DynamicObject, r: &ObjectRef| -> Result<Option<String>, LsError> {
        match check.check_object(obj) {
            Ok(res) => Ok(res.map(|reason| format!("{} is not ready: {}", r, reason))),
            Err(e) => Err(LsError::new(ctx.operation.clone(), "CheckObject", format!("check {:?} on {}: {}", check.name, r, e)).with_code(ErrorCode::ConfigurationProblem)),
        }
    };
    let (evaluate, refs) = (&evaluate, &refs[..]);
    wait_for_objects_healthy(&ctx.options(timeout), ctx.interruption, move || async move {
        let mut results = join_all(refs.iter().map(|r| async move {
            let Some(obj) = ctx.fetch(r).await? else { return Ok(Some(format!("{} not found", r))) };
            evaluate(&obj, r)
        }))
        .await;
        match select_by_labels(ctx, check, managed).await? {
            Ok(objs) => {
                for obj in &objs {
                    let r = ObjectRef::from_object(obj).map_err(|e| LsError::wrap(ctx.operation.clone(), "CheckObject", e))?;
                    results.push(evaluate(obj, &r));
                }
            }
            Err(reason) => results.push(Ok(Some(reason))),
        }
        pending(results)
    })
    .await
}

/// Default check (unless disabled), then every custom check in order.
///
/// `timeout` is the budget left for the whole readiness phase; the configuration may lower it.
pub async fn check_readiness(ctx: &HealthContext<'_>, managed: &[ObjectRef], config: &ReadinessCheckConfiguration, timeout: StdDuration) -> Result<(), LsError> {
    let timeout = config.timeout.map(|d| d.as_std()).unwrap_or(timeout);
    if !config.disable_default {
        check_default_readiness(ctx, managed, timeout).await?;
    }
    for check in &config.custom_readiness_checks {
        check_custom_readiness(ctx, managed, check, timeout).await?;
    }
    Ok(())
}
