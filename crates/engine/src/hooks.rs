//! Extension hooks: named points around the reconcile flow where deployers inject behaviour.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rudder_core::{DeployItem, LsError, ResolvedTarget};
use rustc_hash::FxHashMap;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    /// Before the item is fetched; hooks see neither item nor target.
    Start,
    /// Any result overrides the responsibility decision.
    DuringResponsibilityCheck,
    AfterResponsibilityCheck,
    /// `abort_reconcile = false` forces a reconcile the default logic would skip.
    ShouldReconcile,
    BeforeAnyReconcile,
    BeforeReconcile,
    BeforeDelete,
    BeforeAbort,
    BeforeForceReconcile,
    /// Runs at the end of every cycle that loaded the item.
    End,
}

impl HookType {
    pub const ALL: [HookType; 10] = [
        HookType::Start,
        HookType::DuringResponsibilityCheck,
        HookType::AfterResponsibilityCheck,
        HookType::ShouldReconcile,
        HookType::BeforeAnyReconcile,
        HookType::BeforeReconcile,
        HookType::BeforeDelete,
        HookType::BeforeAbort,
        HookType::BeforeForceReconcile,
        HookType::End,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HookType::Start => "Start",
            HookType::DuringResponsibilityCheck => "DuringResponsibilityCheck",
            HookType::AfterResponsibilityCheck => "AfterResponsibilityCheck",
            HookType::ShouldReconcile => "ShouldReconcile",
            HookType::BeforeAnyReconcile => "BeforeAnyReconcile",
            HookType::BeforeReconcile => "BeforeReconcile",
            HookType::BeforeDelete => "BeforeDelete",
            HookType::BeforeAbort => "BeforeAbort",
            HookType::BeforeForceReconcile => "BeforeForceReconcile",
            HookType::End => "End",
        }
    }

    /// Hook types where every hook must agree to abort; elsewhere a single abort wins.
    pub fn aborts_only_if_all_agree(self) -> bool { matches!(self, HookType::DuringResponsibilityCheck | HookType::ShouldReconcile) }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown hook type {0:?}")]
pub struct HookTypeError(pub String);

impl FromStr for HookType {
    type Err = HookTypeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookType::ALL.into_iter().find(|t| t.as_str() == s).ok_or_else(|| HookTypeError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookResult {
    pub abort_reconcile: bool,
    pub requeue_after: Option<Duration>,
}

impl HookResult {
    pub fn abort() -> Self { Self { abort_reconcile: true, requeue_after: None } }
    pub fn proceed() -> Self { Self::default() }

    pub fn with_requeue(mut self, after: Duration) -> Self {
        self.requeue_after = Some(after);
        self
    }
}

/// Smallest positive duration of the two.
pub fn min_requeue(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a.filter(|d| !d.is_zero()), b.filter(|d| !d.is_zero())) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, y) => x.or(y),
    }
}

/// Merge the results of one hook type. `None` when no hook returned anything.
pub fn aggregate(hook_type: HookType, results: impl IntoIterator<Item = Option<HookResult>>) -> Option<HookResult> {
    let and = hook_type.aborts_only_if_all_agree();
    results.into_iter().flatten().reduce(|acc, r| HookResult {
        abort_reconcile: if and { acc.abort_reconcile && r.abort_reconcile } else { acc.abort_reconcile || r.abort_reconcile },
        requeue_after: min_requeue(acc.requeue_after, r.requeue_after),
    })
}

#[async_trait::async_trait]
pub trait ExtensionHook: Send + Sync {
    async fn call(&self, item: Option<&DeployItem>, target: Option<&ResolvedTarget>, hook_type: HookType) -> Result<Option<HookResult>, LsError>;
}

/// Adapts a plain closure into an [`ExtensionHook`].
pub struct FnHook<F>(pub F);

#[async_trait::async_trait]
impl<F> ExtensionHook for FnHook<F>
where
    F: Fn(Option<&DeployItem>, Option<&ResolvedTarget>, HookType) -> Result<Option<HookResult>, LsError> + Send + Sync,
{
    async fn call(&self, item: Option<&DeployItem>, target: Option<&ResolvedTarget>, hook_type: HookType) -> Result<Option<HookResult>, LsError> {
        (self.0)(item, target, hook_type)
    }
}

/// Hooks per type, run in registration order.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: FxHashMap<HookType, Vec<Arc<dyn ExtensionHook>>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for t in HookType::ALL {
            if let Some(v) = self.hooks.get(&t) { m.entry(&t.as_str(), &v.len()); }
        }
        m.finish()
    }
}

impl HookRegistry {
    pub fn register(&mut self, hook: Arc<dyn ExtensionHook>, types: &[HookType]) -> &mut Self {
        for t in types {
            self.hooks.entry(*t).or_default().push(Arc::clone(&hook));
        }
        self
    }

    pub fn register_fn<F>(&mut self, types: &[HookType], f: F) -> &mut Self
    where
        F: Fn(Option<&DeployItem>, Option<&ResolvedTarget>, HookType) -> Result<Option<HookResult>, LsError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnHook(f)), types)
    }

    /// Append every hook of `other` after ours.
    pub fn merge(&mut self, other: &HookRegistry) -> &mut Self {
        for (t, hooks) in &other.hooks {
            self.hooks.entry(*t).or_default().extend(hooks.iter().cloned());
        }
        self
    }

    pub fn len(&self, hook_type: HookType) -> usize { self.hooks.get(&hook_type).map_or(0, Vec::len) }

    pub fn is_empty(&self) -> bool { self.hooks.values().all(Vec::is_empty) }

    pub async fn execute(&self, item: Option<&DeployItem>, target: Option<&ResolvedTarget>, hook_type: HookType) -> Result<Option<HookResult>, LsError> {
        let Some(hooks) = self.hooks.get(&hook_type) else { return Ok(None) };
        let mut results = Vec::with_capacity(hooks.len());
        for (i, hook) in hooks.iter().enumerate() {
            trace!(hook = %hook_type, index = i, "calling extension hook");
            let res = hook.call(item, target, hook_type).await.map_err(|e| {
                LsError::new("ExecuteHooks", hook_type.as_str(), format!("error executing extension hook {} of type {}: {}", i, hook_type, e.message))
                    .with_codes(e.codes.iter().copied())
            })?;
            results.push(res);
        }
        Ok(aggregate(hook_type, results))
    }

    /// Like [`HookRegistry::execute`] but addressed by name; unknown names are an error.
    pub async fn execute_named(&self, name: &str, item: Option<&DeployItem>, target: Option<&ResolvedTarget>) -> Result<Option<HookResult>, LsError> {
        let hook_type: HookType = name.parse().map_err(|e: HookTypeError| LsError::internal("ExecuteHooks", "UnknownHookType", e.to_string()))?;
        self.execute(item, target, hook_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::ErrorCode;

    fn fixed(r: Option<HookResult>) -> impl Fn(Option<&DeployItem>, Option<&ResolvedTarget>, HookType) -> Result<Option<HookResult>, LsError> + Send + Sync + 'static {
        move |_, _, _| Ok(r)
    }

    fn mixed(t: HookType) -> HookRegistry {
        let mut reg = HookRegistry::default();
        reg.register_fn(&[t], fixed(Some(HookResult::proceed().with_requeue(Duration::from_secs(30)))))
            .register_fn(&[t], fixed(Some(HookResult::abort().with_requeue(Duration::from_secs(10)))))
            .register_fn(&[t], fixed(None));
        reg
    }

    #[tokio::test]
    async fn should_reconcile_needs_every_hook_to_abort() {
        let res = mixed(HookType::ShouldReconcile).execute(None, None, HookType::ShouldReconcile).await.unwrap().unwrap();
        assert!(!res.abort_reconcile);
        assert_eq!(res.requeue_after, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn before_reconcile_aborts_on_any_hook() {
        let res = mixed(HookType::BeforeReconcile).execute(None, None, HookType::BeforeReconcile).await.unwrap().unwrap();
        assert!(res.abort_reconcile);
    }

    #[tokio::test]
    async fn no_hooks_or_only_nil_results_yield_none() {
        let mut reg = HookRegistry::default();
        assert_eq!(reg.execute(None, None, HookType::End).await.unwrap(), None);
        reg.register_fn(&[HookType::End], fixed(None));
        assert_eq!(reg.execute(None, None, HookType::End).await.unwrap(), None);
    }

    #[tokio::test]
    async fn errors_name_the_failing_hook() {
        let mut reg = HookRegistry::default();
        reg.register_fn(&[HookType::Start], fixed(None)).register_fn(&[HookType::Start], |_, _, _| {
            Err(LsError::configuration("Hook", "Broken", "bad config"))
        });
        let err = reg.execute(None, None, HookType::Start).await.unwrap_err();
        assert!(err.message.contains("hook 1 of type Start"), "{}", err.message);
        assert!(err.has_code(ErrorCode::ConfigurationProblem));
    }

    #[tokio::test]
    async fn unknown_names_are_rejected() {
        assert_eq!("ShouldReconcile".parse::<HookType>().unwrap(), HookType::ShouldReconcile);
        assert!("Sometimes".parse::<HookType>().is_err());
        let err = HookRegistry::default().execute_named("Sometimes", None, None).await.unwrap_err();
        assert_eq!(err.reason, "UnknownHookType");
    }

    #[test]
    fn zero_requeue_is_ignored() {
        assert_eq!(min_requeue(Some(Duration::ZERO), Some(Duration::from_secs(3))), Some(Duration::from_secs(3)));
        assert_eq!(min_requeue(None, None), None);
    }
}
