use std::sync::Arc;

use rudder_core::interruption::InterruptionChecker;
use rudder_core::store::get_typed;
use rudder_core::timeout::TimeoutChecker;
use rudder_core::{ClusterStore, DeployItem, LsError, ResolvedTarget, Target};

use crate::hooks::HookRegistry;

/// Everything a deployer gets for one operation on one item.
///
/// The deployer may write `item.status.provider_status`; the engine owns every other status field
/// and persists the item after the call returns.
pub struct DeployContext<'a> {
    pub item: &'a mut DeployItem,
    pub target: Option<&'a ResolvedTarget>,
    pub timeout: &'a dyn TimeoutChecker,
    pub interruption: &'a dyn InterruptionChecker,
}

impl DeployContext<'_> {
    /// Check the progressing budget at a named checkpoint.
    pub fn checkpoint(&self, name: &str) -> Result<std::time::Duration, LsError> { self.timeout.timeout_exceeded(&*self.item, name) }
}

/// Strategy that knows how to install and remove one type of deploy item.
#[async_trait::async_trait]
pub trait Deployer: Send + Sync {
    async fn reconcile(&self, ctx: DeployContext<'_>) -> Result<(), LsError>;

    async fn delete(&self, ctx: DeployContext<'_>) -> Result<(), LsError>;

    /// Reconcile regardless of any cached or short-circuited state.
    async fn force_reconcile(&self, ctx: DeployContext<'_>) -> Result<(), LsError> { self.reconcile(ctx).await }

    /// Stop whatever is in flight. The engine marks the item failed afterwards.
    async fn abort(&self, _ctx: DeployContext<'_>) -> Result<(), LsError> { Ok(()) }

    fn extension_hooks(&self) -> HookRegistry { HookRegistry::default() }
}

/// Turns `spec.target` into a target the deployer can act against.
#[async_trait::async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, item: &DeployItem) -> Result<Option<ResolvedTarget>, LsError>;
}

/// Reads `Target` records from the control-plane store; content is the embedded kubeconfig.
pub struct StoreTargetResolver {
    store: Arc<dyn ClusterStore>,
}

impl StoreTargetResolver {
    pub fn new(store: Arc<dyn ClusterStore>) -> Self { Self { store } }
}

#[async_trait::async_trait]
impl TargetResolver for StoreTargetResolver {
    async fn resolve(&self, item: &DeployItem) -> Result<Option<ResolvedTarget>, LsError> {
        let Some(r) = item.spec.target.as_ref() else { return Ok(None) };
        let ns = r.namespace.as_deref().unwrap_or(item.namespace());
        // Not found stays recoverable; targets are often created after their items.
        let target: Target = get_typed(self.store.as_ref(), ns, &r.name)
            .await
            .map_err(|e| LsError::wrap("ResolveTarget", "GetTarget", format!("target {}/{}: {}", ns, r.name, e)))?;
        let content = target.kubeconfig().map(str::to_string);
        Ok(Some(ResolvedTarget { target, content }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::store::create_typed;
    use rudder_core::TargetRef;
    use rudder_store::MemStore;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_target_in_item_namespace() {
        let store = Arc::new(MemStore::new());
        let mut t = Target::default();
        t.metadata.name = Some("cluster".into());
        t.metadata.namespace = Some("default".into());
        t.spec.type_ = Target::KUBERNETES_CLUSTER.into();
        t.spec.configuration = json!({"kubeconfig": "apiVersion: v1"});
        create_typed(store.as_ref(), &t).await.unwrap();

        let resolver = StoreTargetResolver::new(store);
        let mut di = DeployItem::new("default", "web", "manifest");
        assert!(resolver.resolve(&di).await.unwrap().is_none());

        di.spec.target = Some(TargetRef { name: "cluster".into(), namespace: None });
        let resolved = resolver.resolve(&di).await.unwrap().unwrap();
        assert_eq!(resolved.content.as_deref(), Some("apiVersion: v1"));

        di.spec.target = Some(TargetRef { name: "missing".into(), namespace: None });
        let err = resolver.resolve(&di).await.unwrap_err();
        assert_eq!(err.reason, "GetTarget");
        assert!(!err.is_unrecoverable());
    }
}
