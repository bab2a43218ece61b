//! Rudder ops: grouped teardown of the resources a deploy item manages.
//!
//! Resources are split into ordered deletion groups. A group is only started once every
//! resource of the previous one is confirmed gone, so instances go before their CRDs and
//! namespaced workloads before the cluster roles they rely on.

#![forbid(unsafe_code)]

use std::time::Duration as StdDuration;

use futures::future::join_all;
use rudder_core::interruption::InterruptionChecker;
use rudder_core::managed::{CustomResourceGroup, PredefinedGroup};
use rudder_core::meta;
use rudder_core::timeout::{TimeoutChecker, CHECKPOINT_DELETE_RESOURCES};
use rudder_core::{
    ClusterStore, DeletionGroupDefinition, DeployItem, LsError, ManagedResource, ManagedResourcePolicy, ObjectRef, StoreError, TypeRef,
    MANAGED_BY_LABEL,
};
use tracing::{debug, info, warn};

pub const OPERATION: &str = "DeleteManagedResources";

pub const CRD_GROUP_KIND: &str = "CustomResourceDefinition.apiextensions.k8s.io";

pub const DEFAULT_POLL_INTERVAL: StdDuration = StdDuration::from_secs(5);

/// Namespaced resources, then cluster-scoped ones, then CRDs.
pub fn default_deletion_groups() -> Vec<DeletionGroupDefinition> {
    vec![
        DeletionGroupDefinition::predefined(PredefinedGroup::NamespacedResources),
        DeletionGroupDefinition::predefined(PredefinedGroup::ClusterScopedResources),
        DeletionGroupDefinition::predefined(PredefinedGroup::Crds),
    ]
}

fn is_crd(r: &ObjectRef) -> bool { r.type_ref().group_kind() == CRD_GROUP_KIND }

pub fn group_matches(def: &DeletionGroupDefinition, r: &ObjectRef) -> bool {
    if let Some(p) = &def.predefined_resource_group {
        return match p.group {
            PredefinedGroup::NamespacedResources => r.namespace.is_some(),
            PredefinedGroup::ClusterScopedResources => r.namespace.is_none() && !is_crd(r),
            PredefinedGroup::Crds => is_crd(r),
            PredefinedGroup::Empty => false,
        };
    }
    def.custom_resource_group.as_ref().is_some_and(|c| c.resources.iter().any(|t| t.matches(r)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletionGroup {
    /// `None` for the trailing group of resources no definition matched.
    pub definition: Option<DeletionGroupDefinition>,
    pub resources: Vec<ManagedResource>,
}

impl DeletionGroup {
    pub fn force_delete(&self) -> bool { self.definition.as_ref().is_some_and(|d| d.force_delete()) }

    fn custom(&self) -> Option<&CustomResourceGroup> {
        self.definition.as_ref().filter(|d| d.delete_all_resources()).and_then(|d| d.custom_resource_group.as_ref())
    }
}

/// Assign each resource to the first group that matches it.
///
/// No definitions means the default three groups. Unmatched resources form a trailing group,
/// unless an `empty` group was configured, in which case they are left alone.
pub fn plan_groups(managed: &[ManagedResource], defs: &[DeletionGroupDefinition]) -> Vec<DeletionGroup> {
    let defs = if defs.is_empty() { default_deletion_groups() } else { defs.to_vec() };
    let keep_unmatched = defs.iter().any(|d| d.is_empty_group());
    let mut groups: Vec<DeletionGroup> = defs.into_iter().map(|d| DeletionGroup { definition: Some(d), resources: Vec::new() }).collect();
    let mut unmatched = Vec::new();
    for res in managed {
        match groups.iter_mut().find(|g| g.definition.as_ref().is_some_and(|d| group_matches(d, &res.resource))) {
            Some(g) => g.resources.push(res.clone()),
            None => unmatched.push(res.clone()),
        }
    }
    if !unmatched.is_empty() {
        if keep_unmatched {
            debug!(resources = unmatched.len(), "unmatched resources kept by empty deletion group");
        } else {
            groups.push(DeletionGroup { definition: None, resources: unmatched });
        }
    }
    groups
}

/// Deletes managed resources group by group on one cluster.
pub struct Teardown<'a> {
    store: &'a dyn ClusterStore,
    item: &'a DeployItem,
    timeout: &'a dyn TimeoutChecker,
    interruption: &'a dyn InterruptionChecker,
    interval: StdDuration,
}

impl<'a> Teardown<'a> {
    pub fn new(store: &'a dyn ClusterStore, item: &'a DeployItem, timeout: &'a dyn TimeoutChecker, interruption: &'a dyn InterruptionChecker) -> Self {
        Self { store, item, timeout, interruption, interval: DEFAULT_POLL_INTERVAL }
    }

    pub fn with_interval(mut self, interval: StdDuration) -> Self {
        self.interval = interval;
        self
    }

    /// Remove every deletable resource of `managed`, honouring the group order of `defs`.
    pub async fn delete_managed_resources(&self, managed: &[ManagedResource], defs: &[DeletionGroupDefinition]) -> Result<(), LsError> {
        let deletable = self.deletable(managed).await?;
        let groups = plan_groups(&deletable, defs);
        for (idx, group) in groups.iter().enumerate() {
            self.interruption.check().await?;
            let targets = match group.custom() {
                Some(custom) => self.expand(custom, &group.resources, managed).await?,
                None => group.resources.clone(),
            };
            if targets.is_empty() { continue; }
            info!(item = %self.item.key(), group = idx, resources = targets.len(), force = group.force_delete(), "deleting resource group");
            self.annotate(&targets).await?;
            self.delete_group(idx, targets, group.force_delete()).await?;
        }
        Ok(())
    }

    /// Drop `keep`/`ignore` resources and `fallback` ones that are no longer labelled as ours.
    async fn deletable(&self, managed: &[ManagedResource]) -> Result<Vec<ManagedResource>, LsError> {
        let mut out = Vec::with_capacity(managed.len());
        for m in managed {
            match m.policy {
                p if !p.deletable() => continue,
                ManagedResourcePolicy::Fallback => {
                    let r = &m.resource;
                    match self.store.get_metadata(&r.type_ref(), r.namespace(), &r.name).await {
                        Ok(md) if meta::label(&md, MANAGED_BY_LABEL) == Some(self.item.name()) => out.push(m.clone()),
                        Ok(_) => debug!(item = %self.item.key(), resource = %r, "fallback resource taken over; not deleting"),
                        Err(e) if e.is_gone() => {}
                        Err(e) => return Err(store_error("GetObject", r, e)),
                    }
                }
                _ => out.push(m.clone()),
            }
        }
        Ok(out)
    }

    /// Every cluster object the group's resource types select, not only the ones this item created.
    async fn expand(&self, custom: &CustomResourceGroup, own: &[ManagedResource], managed: &[ManagedResource]) -> Result<Vec<ManagedResource>, LsError> {
        let mut out: Vec<ManagedResource> = Vec::new();
        for t in &custom.resources {
            let type_ref = TypeRef::new(t.api_version.clone(), t.kind.clone());
            let namespaced = match self.store.is_namespaced(&type_ref).await {
                Ok(n) => n,
                Err(e) if e.is_gone() => continue,
                Err(e) => return Err(LsError::wrap(OPERATION, "DiscoverType", format!("unable to determine scope of {}: {}", type_ref, e))),
            };
            let refs: Vec<ObjectRef> = if !namespaced && !t.names.is_empty() {
                t.names.iter().map(|n| ObjectRef::new(&type_ref, None, n)).collect()
            } else {
                let scopes: Vec<Option<&str>> = if namespaced && !t.namespaces.is_empty() {
                    t.namespaces.iter().map(|n| Some(n.as_str())).collect()
                } else {
                    vec![None]
                };
                let mut refs = Vec::new();
                for ns in scopes {
                    let listed = match self.store.list(&type_ref, ns, None).await {
                        Ok(l) => l,
                        Err(e) if e.is_gone() => continue,
                        Err(e) => return Err(LsError::wrap(OPERATION, "ListObjects", format!("unable to list {}: {}", type_ref, e))),
                    };
                    refs.extend(listed.iter().filter_map(|o| ObjectRef::from_object(o).ok()).filter(|r| t.matches(r)));
                }
                refs
            };
            for r in refs {
                if managed.iter().any(|m| !m.policy.deletable() && m.resource.same_object(&r)) { continue; }
                if out.iter().any(|m| m.resource.same_object(&r)) { continue; }
                let res = own.iter().find(|m| m.resource.same_object(&r)).cloned().unwrap_or_else(|| ManagedResource::new(r, ManagedResourcePolicy::Manage));
                out.push(res);
            }
        }
        debug!(item = %self.item.key(), resources = out.len(), "expanded delete-all group");
        Ok(out)
    }

    async fn annotate(&self, targets: &[ManagedResource]) -> Result<(), LsError> {
        for m in targets {
            let Some(annotations) = m.annotate_before_delete.as_ref().filter(|a| !a.is_empty()) else { continue };
            let r = &m.resource;
            let mut obj = match self.store.get(&r.type_ref(), r.namespace(), &r.name).await {
                Ok(o) => o,
                Err(e) if e.is_gone() => continue,
                Err(e) => return Err(store_error("GetObject", r, e)),
            };
            for (k, v) in annotations {
                meta::set_annotation(&mut obj.metadata, k, v);
            }
            match self.store.update(&obj).await {
                Ok(_) => debug!(resource = %r, "annotated before delete"),
                Err(e) if e.is_gone() => {}
                Err(e) => return Err(store_error("AnnotateBeforeDelete", r, e)),
            }
        }
        Ok(())
    }

    async fn delete_group(&self, idx: usize, mut remaining: Vec<ManagedResource>, force: bool) -> Result<(), LsError> {
        let mut round = 1u32;
        loop {
            self.timeout.timeout_exceeded(self.item, CHECKPOINT_DELETE_RESOURCES)?;
            let exists = join_all(remaining.iter().map(|m| self.delete_one(&m.resource, force))).await;
            remaining = remaining.into_iter().zip(exists).filter_map(|(m, e)| e.then_some(m)).collect();
            if remaining.is_empty() {
                debug!(item = %self.item.key(), group = idx, round, "resource group gone");
                return Ok(());
            }
            self.interruption.check().await?;
            debug!(item = %self.item.key(), group = idx, round, remaining = remaining.len(), "waiting for resources to disappear");
            round += 1;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Issue the delete and report whether the object still exists.
    async fn delete_one(&self, r: &ObjectRef, force: bool) -> bool {
        let t = r.type_ref();
        match self.store.delete(&t, r.namespace(), &r.name).await {
            Ok(()) => {}
            Err(e) if e.is_gone() => return gone(r),
            Err(e) => {
                info!(resource = %r, error = %e, "error deleting resource");
                return true;
            }
        }
        if force {
            if let Err(e) = self.clear_finalizers(r).await {
                if e.is_gone() { return gone(r); }
                info!(resource = %r, error = %e, "error removing finalizers");
                return true;
            }
        }
        match self.store.get_metadata(&t, r.namespace(), &r.name).await {
            Err(e) if e.is_gone() => gone(r),
            Err(e) => {
                warn!(resource = %r, error = %e, "unable to confirm deletion");
                true
            }
            Ok(_) => true,
        }
    }

    async fn clear_finalizers(&self, r: &ObjectRef) -> Result<(), StoreError> {
        let mut obj = self.store.get(&r.type_ref(), r.namespace(), &r.name).await?;
        if obj.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty()) { return Ok(()); }
        obj.metadata.finalizers = None;
        self.store.update(&obj).await?;
        debug!(resource = %r, "finalizers removed");
        Ok(())
    }
}

fn gone(r: &ObjectRef) -> bool {
    metrics::counter!("rudder_teardown_deleted_total", 1u64);
    debug!(resource = %r, "resource deleted");
    false
}

fn store_error(reason: &str, r: &ObjectRef, e: StoreError) -> LsError { LsError::wrap(OPERATION, reason, format!("{}: {}", r, e)) }

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::managed::ResourceType;

    fn res(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> ManagedResource {
        ManagedResource::new(ObjectRef::new(&TypeRef::new(api_version, kind), ns, name), ManagedResourcePolicy::Manage)
    }

    fn names(g: &DeletionGroup) -> Vec<&str> { g.resources.iter().map(|m| m.resource.name.as_str()).collect() }

    #[test]
    fn default_groups_split_by_scope() {
        let managed = vec![
            res("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "crd"),
            res("rbac.authorization.k8s.io/v1", "ClusterRole", None, "role"),
            res("v1", "ServiceAccount", Some("ns"), "sa"),
        ];
        let groups = plan_groups(&managed, &[]);
        assert_eq!(groups.len(), 3);
        assert_eq!(names(&groups[0]), ["sa"]);
        assert_eq!(names(&groups[1]), ["role"]);
        assert_eq!(names(&groups[2]), ["crd"]);
    }

    #[test]
    fn unmatched_resources_trail() {
        let managed = vec![res("v1", "ServiceAccount", Some("ns"), "sa"), res("rbac.authorization.k8s.io/v1", "ClusterRole", None, "role")];
        let groups = plan_groups(&managed, &[DeletionGroupDefinition::predefined(PredefinedGroup::ClusterScopedResources)]);
        assert_eq!(groups.len(), 2);
        assert_eq!(names(&groups[0]), ["role"]);
        assert!(groups[1].definition.is_none());
        assert_eq!(names(&groups[1]), ["sa"]);
    }

    #[test]
    fn empty_group_keeps_unmatched() {
        let managed = vec![res("v1", "ServiceAccount", Some("ns"), "sa")];
        let groups = plan_groups(&managed, &[DeletionGroupDefinition::predefined(PredefinedGroup::Empty)]);
        assert!(groups.iter().all(|g| g.resources.is_empty()));
    }

    #[test]
    fn first_matching_group_wins() {
        let rt = ResourceType { api_version: "v1".into(), kind: "ConfigMap".into(), names: vec!["a".into()], namespaces: vec![] };
        let managed = vec![res("v1", "ConfigMap", Some("ns"), "a"), res("v1", "ConfigMap", Some("ns"), "b")];
        let groups = plan_groups(
            &managed,
            &[DeletionGroupDefinition::custom(vec![rt], false), DeletionGroupDefinition::predefined(PredefinedGroup::NamespacedResources)],
        );
        assert_eq!(names(&groups[0]), ["a"]);
        assert_eq!(names(&groups[1]), ["b"]);
    }
}
