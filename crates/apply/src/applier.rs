//! Creates or updates manifests on the target cluster, CRDs first.

use kube::core::DynamicObject;
use rudder_core::interruption::InterruptionChecker;
use rudder_core::{annotations, meta, ClusterStore, DeployItem, ErrorCode, LsError, ManagedResource, ManagedResourcePolicy, ObjectRef, StoreError, TypeRef, MANAGED_BY_LABEL};
use rudder_ops::CRD_GROUP_KIND;
use tracing::{debug, info, trace};

use crate::config::{Manifest, UpdateStrategy};
use crate::diff::{desired_state, diff_summary, strip_noisy};

pub const OPERATION: &str = "ApplyManifests";

const DEFAULT_NAMESPACE: &str = "default";

/// Apply order: CRDs, then cluster-scoped kinds, then namespaced ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Crd,
    ClusterScoped,
    Namespaced,
}

fn store_error(reason: &str, what: impl std::fmt::Display, e: StoreError) -> LsError {
    LsError::wrap(OPERATION, reason, format!("{}: {}", what, e))
}

fn to_json(obj: &DynamicObject) -> Result<serde_json::Value, LsError> {
    serde_json::to_value(obj).map_err(|e| LsError::internal(OPERATION, "EncodeObject", e.to_string()))
}

/// Records `intent` as the last applied manifest, replacing whatever the live object carried.
fn stamp_last_applied(v: &mut serde_json::Value, intent: &str) {
    let Some(meta) = v.get_mut("metadata").and_then(serde_json::Value::as_object_mut) else { return };
    let ann = meta.entry("annotations").or_insert_with(|| serde_json::json!({}));
    if !ann.is_object() { *ann = serde_json::json!({}); }
    if let Some(a) = ann.as_object_mut() {
        a.insert(annotations::LAST_APPLIED.to_string(), serde_json::Value::String(intent.to_string()));
    }
}

fn from_json(v: serde_json::Value, what: &str) -> Result<DynamicObject, LsError> {
    serde_json::from_value(v).map_err(|e| LsError::new(OPERATION, "DecodeManifest", format!("{}: {}", what, e)).with_code(ErrorCode::ConfigurationProblem))
}

pub struct Applier<'a> {
    store: &'a dyn ClusterStore,
    item: &'a DeployItem,
    strategy: UpdateStrategy,
}

impl<'a> Applier<'a> {
    pub fn new(store: &'a dyn ClusterStore, item: &'a DeployItem, strategy: UpdateStrategy) -> Self { Self { store, item, strategy } }

    /// Apply every manifest that is not ignored; returns what is now managed, in apply order.
    pub async fn apply_all(&self, manifests: &[Manifest], interruption: &dyn InterruptionChecker) -> Result<Vec<ManagedResource>, LsError> {
        let mut ranked = Vec::with_capacity(manifests.len());
        for m in manifests.iter().filter(|m| m.policy != ManagedResourcePolicy::Ignore) {
            ranked.push((self.rank(m).await?, m));
        }
        ranked.sort_by_key(|(rank, _)| *rank);

        let mut out = Vec::with_capacity(ranked.len());
        for (_, m) in ranked {
            interruption.check().await?;
            out.push(self.apply(m).await?);
        }
        Ok(out)
    }

    fn type_ref(m: &Manifest) -> TypeRef {
        TypeRef::new(m.api_version().unwrap_or_default(), m.kind().unwrap_or_default())
    }

    async fn rank(&self, m: &Manifest) -> Result<Rank, LsError> {
        let type_ref = Self::type_ref(m);
        if type_ref.group_kind() == CRD_GROUP_KIND { return Ok(Rank::Crd); }
        match self.store.is_namespaced(&type_ref).await {
            Ok(true) => Ok(Rank::Namespaced),
            Ok(false) => Ok(Rank::ClusterScoped),
            // Possibly defined by a CRD of this same list; resolved again when applied.
            Err(StoreError::NoMatch(_)) => Ok(Rank::Namespaced),
            Err(e) => Err(store_error("ResolveScope", type_ref, e)),
        }
    }

    async fn apply(&self, m: &Manifest) -> Result<ManagedResource, LsError> {
        let type_ref = Self::type_ref(m);
        let name = m.name().unwrap_or_default();
        let namespaced = self.store.is_namespaced(&type_ref).await.map_err(|e| store_error("ResolveScope", &type_ref, e))?;

        let mut obj = from_json(m.manifest.clone(), name)?;
        obj.metadata.namespace = namespaced.then(|| m.namespace().unwrap_or(DEFAULT_NAMESPACE).to_string());
        meta::set_label(&mut obj.metadata, MANAGED_BY_LABEL, self.item.name());
        let mut r = ObjectRef::new(&type_ref, obj.metadata.namespace.as_deref(), name);
        let intent = serde_json::to_string(&strip_noisy(to_json(&obj)?)).map_err(|e| LsError::internal(OPERATION, "EncodeObject", e.to_string()))?;
        meta::set_annotation(&mut obj.metadata, annotations::LAST_APPLIED, &intent);

        let live = match self.store.get(&type_ref, r.namespace(), name).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => {
                for (k, v) in m.annotate_before_create.iter().flatten() {
                    meta::set_annotation(&mut obj.metadata, k, v);
                }
                let created = self.store.create(&obj).await.map_err(|e| store_error("CreateObject", &r, e))?;
                metrics::counter!("rudder_manifests_applied_total", 1u64);
                info!(item = %self.item.key(), resource = %r, "created");
                r.uid = created.metadata.uid;
                return Ok(self.managed(m, r));
            }
            Err(e) => return Err(store_error("GetObject", &r, e)),
        };
        r.uid = live.metadata.uid.clone();

        if m.policy == ManagedResourcePolicy::Immutable {
            trace!(item = %self.item.key(), resource = %r, "immutable; not updating");
            return Ok(self.managed(m, r));
        }
        if m.policy == ManagedResourcePolicy::Fallback && meta::label(&live.metadata, MANAGED_BY_LABEL) != Some(self.item.name()) {
            info!(item = %self.item.key(), resource = %r, "fallback resource owned elsewhere; not updating");
            return Ok(self.managed(m, r));
        }

        let live_json = to_json(&live)?;
        let mut desired = desired_state(&live_json, &to_json(&obj)?, self.strategy);
        stamp_last_applied(&mut desired, &intent);
        // Fields only present live (server defaults, foreign annotations) do not count as drift.
        // Removals from the manifest show up as a changed last-applied annotation.
        let drift = diff_summary(&strip_noisy(desired.clone()), &strip_noisy(live_json));
        if drift.adds == 0 && drift.updates == 0 {
            metrics::counter!("rudder_manifests_unchanged_total", 1u64);
            trace!(item = %self.item.key(), resource = %r, "unchanged");
            return Ok(self.managed(m, r));
        }

        let mut next = from_json(desired, name)?;
        next.metadata.resource_version = live.metadata.resource_version.clone();
        next.metadata.namespace = obj.metadata.namespace.clone();
        meta::set_label(&mut next.metadata, MANAGED_BY_LABEL, self.item.name());
        self.store.update(&next).await.map_err(|e| store_error("UpdateObject", &r, e))?;
        metrics::counter!("rudder_manifests_applied_total", 1u64);
        debug!(item = %self.item.key(), resource = %r, adds = drift.adds, updates = drift.updates, "updated");
        Ok(self.managed(m, r))
    }

    fn managed(&self, m: &Manifest, r: ObjectRef) -> ManagedResource {
        ManagedResource { resource: r, policy: m.policy, annotate_before_delete: m.annotate_before_delete.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::interruption::NoInterruption;
    use rudder_store::{MemStore, Verb};
    use serde_json::json;

    fn manifest(v: serde_json::Value) -> Manifest { Manifest::new(v) }

    fn config_map(name: &str, data: serde_json::Value) -> Manifest {
        manifest(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": data}))
    }

    #[tokio::test]
    async fn crds_and_cluster_scoped_kinds_go_first() {
        let store = MemStore::new();
        let di = DeployItem::new("default", "web", "manifest");
        let manifests = vec![
            manifest(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w", "namespace": "apps"}})),
            config_map("cm", json!({})),
            manifest(json!({"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": {"name": "reader"}})),
            manifest(json!({
                "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
                "metadata": {"name": "widgets.example.com"},
                "spec": {"group": "example.com", "scope": "Namespaced", "names": {"kind": "Widget"}}
            })),
        ];
        let applied = Applier::new(&store, &di, UpdateStrategy::Update).apply_all(&manifests, &NoInterruption).await.unwrap();
        let kinds: Vec<&str> = applied.iter().map(|m| m.resource.kind.as_str()).collect();
        assert_eq!(kinds, ["CustomResourceDefinition", "ClusterRole", "Widget", "ConfigMap"]);
        assert_eq!(applied[3].resource.namespace.as_deref(), Some("default"), "namespaced kinds default their namespace");
        assert_eq!(applied[1].resource.namespace, None);
        assert!(applied.iter().all(|m| m.resource.uid.is_some()));

        let cm = store.get_metadata(&TypeRef::new("v1", "ConfigMap"), Some("default"), "cm").await.unwrap();
        assert_eq!(meta::label(&cm, MANAGED_BY_LABEL), Some("web"));
    }

    #[tokio::test]
    async fn unchanged_manifests_are_not_rewritten() {
        let store = MemStore::new();
        let di = DeployItem::new("default", "web", "manifest");
        let manifests = vec![config_map("cm", json!({"k": "v"}))];
        let applier = Applier::new(&store, &di, UpdateStrategy::Update);
        applier.apply_all(&manifests, &NoInterruption).await.unwrap();
        store.clear_journal();

        applier.apply_all(&manifests, &NoInterruption).await.unwrap();
        assert!(store.journal().is_empty());

        applier.apply_all(&[config_map("cm", json!({"k": "changed"}))], &NoInterruption).await.unwrap();
        assert_eq!(store.journal(), [(Verb::Update, "ConfigMap default/cm".to_string())]);
    }

    #[tokio::test]
    async fn removed_keys_are_dropped_from_the_live_object() {
        let store = MemStore::new();
        let di = DeployItem::new("default", "web", "manifest");
        let applier = Applier::new(&store, &di, UpdateStrategy::Update);
        applier.apply_all(&[config_map("cm", json!({"a": "1", "b": "2"}))], &NoInterruption).await.unwrap();

        applier.apply_all(&[config_map("cm", json!({"a": "1"}))], &NoInterruption).await.unwrap();
        let live = store.get(&TypeRef::new("v1", "ConfigMap"), Some("default"), "cm").await.unwrap();
        assert_eq!(live.data["data"], json!({"a": "1"}));
    }

    #[tokio::test]
    async fn shrunk_arrays_are_applied() {
        let store = MemStore::new();
        let di = DeployItem::new("default", "web", "manifest");
        let deployment = |args: serde_json::Value| {
            manifest(json!({
                "apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web"},
                "spec": {"template": {"spec": {"containers": [{"name": "app", "image": "nginx", "args": args}]}}}
            }))
        };
        let applier = Applier::new(&store, &di, UpdateStrategy::Update);
        applier.apply_all(&[deployment(json!(["a", "b"]))], &NoInterruption).await.unwrap();
        applier.apply_all(&[deployment(json!(["a"]))], &NoInterruption).await.unwrap();

        let live = store.get(&TypeRef::new("apps/v1", "Deployment"), Some("default"), "web").await.unwrap();
        assert_eq!(live.data["spec"]["template"]["spec"]["containers"][0]["args"], json!(["a"]));
    }

    #[tokio::test]
    async fn live_only_fields_do_not_trigger_updates() {
        let store = MemStore::new();
        let di = DeployItem::new("default", "web", "manifest");
        let manifests = vec![config_map("cm", json!({"k": "v"}))];
        let applier = Applier::new(&store, &di, UpdateStrategy::Update);
        applier.apply_all(&manifests, &NoInterruption).await.unwrap();

        let cm = TypeRef::new("v1", "ConfigMap");
        let mut live = store.get(&cm, Some("default"), "cm").await.unwrap();
        live.data["immutable"] = json!(false);
        meta::set_annotation(&mut live.metadata, "example.com/touched", "yes");
        store.update(&live).await.unwrap();
        store.clear_journal();

        applier.apply_all(&manifests, &NoInterruption).await.unwrap();
        assert!(store.journal().is_empty());
    }

    #[tokio::test]
    async fn policies_guard_existing_objects() {
        let store = MemStore::new();
        let di = DeployItem::new("default", "web", "manifest");
        let other = DeployItem::new("default", "other", "manifest");
        Applier::new(&store, &other, UpdateStrategy::Update).apply_all(&[config_map("shared", json!({"k": "theirs"}))], &NoInterruption).await.unwrap();
        Applier::new(&store, &di, UpdateStrategy::Update).apply_all(&[config_map("frozen", json!({"k": "v1"}))], &NoInterruption).await.unwrap();

        let mut fallback = config_map("shared", json!({"k": "ours"}));
        fallback.policy = ManagedResourcePolicy::Fallback;
        let mut immutable = config_map("frozen", json!({"k": "v2"}));
        immutable.policy = ManagedResourcePolicy::Immutable;
        let mut ignored = config_map("skipped", json!({}));
        ignored.policy = ManagedResourcePolicy::Ignore;

        let applied = Applier::new(&store, &di, UpdateStrategy::Update).apply_all(&[fallback, immutable, ignored], &NoInterruption).await.unwrap();
        assert_eq!(applied.len(), 2);
        let cm = TypeRef::new("v1", "ConfigMap");
        assert_eq!(store.get(&cm, Some("default"), "shared").await.unwrap().data["data"]["k"], "theirs");
        assert_eq!(store.get(&cm, Some("default"), "frozen").await.unwrap().data["data"]["k"], "v1");
        assert!(store.get(&cm, Some("default"), "skipped").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn merge_strategy_keeps_live_fields() {
        let store = MemStore::new();
        let di = DeployItem::new("default", "web", "manifest");
        Applier::new(&store, &di, UpdateStrategy::Update).apply_all(&[config_map("cm", json!({"a": "1", "b": "live"}))], &NoInterruption).await.unwrap();

        Applier::new(&store, &di, UpdateStrategy::Merge).apply_all(&[config_map("cm", json!({"b": "new", "c": "3"}))], &NoInterruption).await.unwrap();
        let live = store.get(&TypeRef::new("v1", "ConfigMap"), Some("default"), "cm").await.unwrap();
        assert_eq!(live.data["data"], json!({"a": "1", "b": "live", "c": "3"}));

        Applier::new(&store, &di, UpdateStrategy::MergeOverwrite).apply_all(&[config_map("cm", json!({"b": "new"}))], &NoInterruption).await.unwrap();
        let live = store.get(&TypeRef::new("v1", "ConfigMap"), Some("default"), "cm").await.unwrap();
        assert_eq!(live.data["data"], json!({"a": "1", "b": "new", "c": "3"}));
    }

    #[tokio::test]
    async fn unknown_kind_is_a_recoverable_error() {
        let store = MemStore::new();
        store.unserve(&TypeRef::new("example.com/v1", "Widget"));
        let di = DeployItem::new("default", "web", "manifest");
        let m = manifest(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}}));
        let err = Applier::new(&store, &di, UpdateStrategy::Update).apply_all(&[m], &NoInterruption).await.unwrap_err();
        assert_eq!(err.reason, "ResolveScope");
        assert!(!err.is_unrecoverable());
    }
}
