use std::sync::Arc;
use std::time::Duration as StdDuration;

use rudder_core::timeout::{CHECKPOINT_APPLY_MANIFESTS, CHECKPOINT_BEFORE_READINESS_CHECK, CHECKPOINT_CLEANUP_ORPHANED, CHECKPOINT_DELETE_RESOURCES, CHECKPOINT_PROCESS_MANIFESTS};
use rudder_core::{ClusterConnector, ClusterStore, DeletionGroupDefinition, DeployItem, ErrorCode, LsError, ManagedResource, ObjectRef, ResolvedTarget, Target};
use rudder_engine::{DeployContext, Deployer};
use rudder_health::{check_readiness, DefaultChecks, HealthContext, DEFAULT_POLL_INTERVAL};
use rudder_ops::Teardown;
use tracing::{info, warn};

use crate::applier::Applier;
use crate::config::{ManifestConfiguration, ProviderStatus};

pub const DEPLOYER_TYPE: &str = "rudder.dev/manifest";

/// Applies the raw manifests of a deploy item to its target cluster.
pub struct ManifestDeployer {
    connector: Arc<dyn ClusterConnector>,
    checks: DefaultChecks,
    poll_interval: StdDuration,
}

impl ManifestDeployer {
    pub fn new(connector: Arc<dyn ClusterConnector>) -> Self {
        Self { connector, checks: DefaultChecks::default(), poll_interval: DEFAULT_POLL_INTERVAL }
    }

    /// Interval for readiness polls and teardown rounds.
    pub fn with_poll_interval(mut self, interval: StdDuration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn connect(&self, target: Option<&ResolvedTarget>) -> Result<Arc<dyn ClusterStore>, LsError> {
        if let Some(t) = target {
            let type_ = t.target.spec.type_.as_str();
            if !type_.is_empty() && type_ != Target::KUBERNETES_CLUSTER {
                return Err(LsError::new("ConnectTarget", "UnsupportedTargetType", format!("target type {:?} is not supported", type_))
                    .with_code(ErrorCode::ConfigurationProblem));
            }
        }
        self.connector.connect(target).await
    }

    async fn teardown(&self, ctx: &DeployContext<'_>, store: &dyn ClusterStore, managed: &[ManagedResource], groups: &[DeletionGroupDefinition]) -> Result<(), LsError> {
        Teardown::new(store, &*ctx.item, ctx.timeout, ctx.interruption).with_interval(self.poll_interval).delete_managed_resources(managed, groups).await
    }
}

/// Same kind, namespace and name. UIDs are ignored: a recreated object is still the one we manage.
fn same_slot(a: &ObjectRef, b: &ObjectRef) -> bool {
    a.type_ref().group_kind() == b.type_ref().group_kind() && a.namespace == b.namespace && a.name == b.name
}

fn orphans(previous: &[ManagedResource], current: &[ManagedResource]) -> Vec<ManagedResource> {
    previous.iter().filter(|p| !current.iter().any(|c| same_slot(&c.resource, &p.resource))).cloned().collect()
}

fn set_status(item: &mut DeployItem, managed: Vec<ManagedResource>) {
    item.status.provider_status = Some(ProviderStatus { managed_resources: managed }.to_value());
}

#[async_trait::async_trait]
impl Deployer for ManifestDeployer {
    async fn reconcile(&self, ctx: DeployContext<'_>) -> Result<(), LsError> {
        let key = ctx.item.key();
        ctx.checkpoint(CHECKPOINT_PROCESS_MANIFESTS)?;
        let config = ManifestConfiguration::from_item(&*ctx.item)?;
        let previous = ProviderStatus::from_item(&*ctx.item)?.managed_resources;
        let store = self.connect(ctx.target).await?;

        ctx.checkpoint(CHECKPOINT_APPLY_MANIFESTS)?;
        let applied = Applier::new(store.as_ref(), &*ctx.item, config.update_strategy).apply_all(&config.manifests, ctx.interruption).await?;

        let stale = orphans(&previous, &applied);
        // Orphans stay recorded until they are really gone.
        set_status(&mut *ctx.item, applied.iter().chain(&stale).cloned().collect());
        if !stale.is_empty() {
            ctx.checkpoint(CHECKPOINT_CLEANUP_ORPHANED)?;
            info!(item = %key, resources = stale.len(), "removing resources no longer in the manifest list");
            self.teardown(&ctx, store.as_ref(), &stale, &config.deletion_groups_during_update).await?;
            set_status(&mut *ctx.item, applied.clone());
        }

        let remaining = ctx.checkpoint(CHECKPOINT_BEFORE_READINESS_CHECK)?;
        let refs: Vec<ObjectRef> = applied.iter().map(|m| m.resource.clone()).collect();
        let health = HealthContext::new(store.as_ref(), ctx.interruption, &self.checks, "CheckResourceReadiness").with_interval(self.poll_interval);
        check_readiness(&health, &refs, &config.readiness_checks, remaining).await?;
        info!(item = %key, resources = applied.len(), "manifests applied and ready");
        Ok(())
    }

    async fn delete(&self, ctx: DeployContext<'_>) -> Result<(), LsError> {
        let key = ctx.item.key();
        let groups = match ManifestConfiguration::from_item(&*ctx.item) {
            Ok(c) => c.deletion_groups,
            Err(e) => {
                warn!(item = %key, error = %e, "configuration unreadable; using default deletion groups");
                Vec::new()
            }
        };
        let managed = ProviderStatus::from_item(&*ctx.item)?.managed_resources;
        if managed.is_empty() { return Ok(()); }
        let store = self.connect(ctx.target).await?;
        ctx.checkpoint(CHECKPOINT_DELETE_RESOURCES)?;
        self.teardown(&ctx, store.as_ref(), &managed, &groups).await?;
        set_status(&mut *ctx.item, Vec::new());
        info!(item = %key, resources = managed.len(), "managed resources deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::{ManagedResourcePolicy, TypeRef};

    fn res(kind: &str, name: &str, uid: Option<&str>) -> ManagedResource {
        let mut r = ObjectRef::new(&TypeRef::new("v1", kind), Some("default"), name);
        r.uid = uid.map(str::to_string);
        ManagedResource::new(r, ManagedResourcePolicy::Manage)
    }

    #[test]
    fn orphans_are_previous_resources_not_applied_again() {
        let previous = vec![res("ConfigMap", "a", Some("1")), res("ConfigMap", "b", Some("2")), res("Secret", "a", None)];
        let current = vec![res("ConfigMap", "a", Some("1")), res("Secret", "a", Some("3"))];
        let names: Vec<String> = orphans(&previous, &current).iter().map(|m| m.resource.to_string()).collect();
        assert_eq!(names, ["ConfigMap default/b"]);
    }

    #[test]
    fn recreated_object_is_not_an_orphan() {
        let previous = vec![res("ConfigMap", "a", Some("old"))];
        let current = vec![res("ConfigMap", "a", Some("new"))];
        assert!(orphans(&previous, &current).is_empty());
    }
}
