#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use rudder_core::interruption::{NoInterruption, StoreInterruptionChecker};
use rudder_core::managed::ResourceType;
use rudder_core::store::{create_typed, get_typed, update_typed};
use rudder_core::timeout::{CheckpointTimeoutChecker, IgnoreTimeoutChecker, CHECKPOINT_DELETE_RESOURCES};
use rudder_core::{
    annotations, meta, ClusterStore, DeletionGroupDefinition, DeployItem, ErrorCode, ManagedResource, ManagedResourcePolicy, ObjectRef,
    PredefinedGroup, MANAGED_BY_LABEL,
};
use rudder_ops::Teardown;
use rudder_store::{MemStore, Verb};
use serde_json::json;

const FAST: Duration = Duration::from_millis(5);

fn obj(api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> DynamicObject {
    let mut v = json!({"apiVersion": api_version, "kind": kind, "metadata": {"name": name}});
    if let Some(ns) = ns { v["metadata"]["namespace"] = ns.into(); }
    serde_json::from_value(v).unwrap()
}

async fn seed(store: &MemStore, o: DynamicObject, policy: ManagedResourcePolicy) -> ManagedResource {
    let created = store.create(&o).await.unwrap();
    ManagedResource::new(ObjectRef::from_object(&created).unwrap(), policy)
}

fn item() -> DeployItem { DeployItem::new("default", "web", "manifest") }

fn position(journal: &[(Verb, String)], verb: Verb, what: &str) -> usize {
    journal.iter().position(|(v, w)| *v == verb && w == what).unwrap_or_else(|| panic!("{verb:?} {what} not in {journal:?}"))
}

#[tokio::test]
async fn cluster_scoped_group_goes_first_then_unmatched() {
    let store = MemStore::new();
    let mut managed = Vec::new();
    for name in ["sa1", "sa2"] {
        managed.push(seed(&store, obj("v1", "ServiceAccount", Some("default"), name), ManagedResourcePolicy::Manage).await);
    }
    for name in ["role1", "role2"] {
        managed.push(seed(&store, obj("rbac.authorization.k8s.io/v1", "ClusterRole", None, name), ManagedResourcePolicy::Manage).await);
    }
    store.clear_journal();

    let di = item();
    let groups = [DeletionGroupDefinition::predefined(PredefinedGroup::ClusterScopedResources)];
    Teardown::new(&store, &di, &IgnoreTimeoutChecker::default(), &NoInterruption)
        .with_interval(FAST)
        .delete_managed_resources(&managed, &groups)
        .await
        .unwrap();

    let journal = store.journal();
    let last_role = position(&journal, Verb::Delete, "ClusterRole role1").max(position(&journal, Verb::Delete, "ClusterRole role2"));
    let first_sa = position(&journal, Verb::Delete, "ServiceAccount default/sa1").min(position(&journal, Verb::Delete, "ServiceAccount default/sa2"));
    assert!(last_role < first_sa, "{journal:?}");
    assert!(store.snapshot().is_empty());
}

#[tokio::test]
async fn next_group_waits_until_previous_is_gone() {
    let store = Arc::new(MemStore::new());
    let mut held = obj("rbac.authorization.k8s.io/v1", "ClusterRole", None, "held");
    held.metadata.finalizers = Some(vec!["example.com/hold".into()]);
    let role = seed(&store, held, ManagedResourcePolicy::Manage).await;
    let sa = seed(&store, obj("v1", "ServiceAccount", Some("default"), "sa"), ManagedResourcePolicy::Manage).await;
    store.clear_journal();

    let release = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let t = rudder_core::TypeRef::new("rbac.authorization.k8s.io/v1", "ClusterRole");
            let mut o = store.get(&t, None, "held").await.unwrap();
            o.metadata.finalizers = None;
            store.update(&o).await.unwrap();
        })
    };

    let di = item();
    let groups = [
        DeletionGroupDefinition::predefined(PredefinedGroup::ClusterScopedResources),
        DeletionGroupDefinition::predefined(PredefinedGroup::NamespacedResources),
    ];
    Teardown::new(store.as_ref(), &di, &IgnoreTimeoutChecker::default(), &NoInterruption)
        .with_interval(FAST)
        .delete_managed_resources(&[sa, role], &groups)
        .await
        .unwrap();
    release.await.unwrap();

    let journal = store.journal();
    assert!(position(&journal, Verb::Update, "ClusterRole held") < position(&journal, Verb::Delete, "ServiceAccount default/sa"), "{journal:?}");
}

#[tokio::test]
async fn force_delete_clears_finalizers() {
    let store = MemStore::new();
    let mut stuck = obj("v1", "ConfigMap", Some("default"), "stuck");
    stuck.metadata.finalizers = Some(vec!["example.com/hold".into()]);
    let cm = seed(&store, stuck, ManagedResourcePolicy::Manage).await;

    let di = item();
    let groups = [DeletionGroupDefinition::predefined(PredefinedGroup::NamespacedResources).with_force_delete()];
    Teardown::new(&store, &di, &IgnoreTimeoutChecker::default(), &NoInterruption)
        .with_interval(FAST)
        .delete_managed_resources(&[cm], &groups)
        .await
        .unwrap();
    assert!(store.snapshot().is_empty());
}

#[tokio::test]
async fn delete_all_resources_includes_foreign_objects() {
    let store = MemStore::new();
    let own = seed(&store, obj("v1", "ConfigMap", Some("default"), "own"), ManagedResourcePolicy::Manage).await;
    let kept = seed(&store, obj("v1", "ConfigMap", Some("default"), "kept"), ManagedResourcePolicy::Keep).await;
    store.create(&obj("v1", "ConfigMap", Some("default"), "foreign")).await.unwrap();
    store.create(&obj("v1", "ConfigMap", Some("other"), "elsewhere")).await.unwrap();
    store.create(&obj("v1", "Secret", Some("default"), "unrelated")).await.unwrap();

    let rt = ResourceType { api_version: "v1".into(), kind: "ConfigMap".into(), names: vec![], namespaces: vec!["default".into()] };
    let di = item();
    Teardown::new(&store, &di, &IgnoreTimeoutChecker::default(), &NoInterruption)
        .with_interval(FAST)
        .delete_managed_resources(&[own, kept], &[DeletionGroupDefinition::custom(vec![rt], true)])
        .await
        .unwrap();

    let left: Vec<String> = store.snapshot().iter().map(|o| meta::key(&o.metadata)).collect();
    assert_eq!(left, ["default/kept", "other/elsewhere", "default/unrelated"]);
}

#[tokio::test]
async fn policies_decide_what_is_deleted() {
    let store = MemStore::new();
    let keep = seed(&store, obj("v1", "ConfigMap", Some("default"), "keep"), ManagedResourcePolicy::Keep).await;
    let ignore = seed(&store, obj("v1", "ConfigMap", Some("default"), "ignore"), ManagedResourcePolicy::Ignore).await;
    let immutable = seed(&store, obj("v1", "ConfigMap", Some("default"), "immutable"), ManagedResourcePolicy::Immutable).await;
    let mut ours = obj("v1", "ConfigMap", Some("default"), "fallback-ours");
    meta::set_label(&mut ours.metadata, MANAGED_BY_LABEL, "web");
    let ours = seed(&store, ours, ManagedResourcePolicy::Fallback).await;
    let mut theirs = obj("v1", "ConfigMap", Some("default"), "fallback-theirs");
    meta::set_label(&mut theirs.metadata, MANAGED_BY_LABEL, "someone-else");
    let theirs = seed(&store, theirs, ManagedResourcePolicy::Fallback).await;

    let di = item();
    Teardown::new(&store, &di, &IgnoreTimeoutChecker::default(), &NoInterruption)
        .with_interval(FAST)
        .delete_managed_resources(&[keep, ignore, immutable, ours, theirs], &[])
        .await
        .unwrap();

    let left: Vec<String> = store.snapshot().iter().map(|o| o.metadata.name.clone().unwrap_or_default()).collect();
    assert_eq!(left, ["fallback-theirs", "ignore", "keep"]);
}

#[tokio::test]
async fn annotations_are_set_before_delete() {
    let store = MemStore::new();
    let mut cm = seed(&store, obj("v1", "ConfigMap", Some("default"), "cm"), ManagedResourcePolicy::Manage).await;
    cm.annotate_before_delete = Some([("example.com/reason".to_string(), "teardown".to_string())].into_iter().collect());
    store.clear_journal();

    let di = item();
    Teardown::new(&store, &di, &IgnoreTimeoutChecker::default(), &NoInterruption)
        .with_interval(FAST)
        .delete_managed_resources(&[cm], &[])
        .await
        .unwrap();
    let journal = store.journal();
    assert!(position(&journal, Verb::Update, "ConfigMap default/cm") < position(&journal, Verb::Delete, "ConfigMap default/cm"));
}

#[tokio::test]
async fn checkpoint_timeout_stops_before_deleting() {
    let store = MemStore::new();
    let cm = seed(&store, obj("v1", "ConfigMap", Some("default"), "cm"), ManagedResourcePolicy::Manage).await;
    let di = item();
    let err = Teardown::new(&store, &di, &CheckpointTimeoutChecker::new(CHECKPOINT_DELETE_RESOURCES), &NoInterruption)
        .with_interval(FAST)
        .delete_managed_resources(&[cm], &[])
        .await
        .unwrap_err();
    assert!(err.has_code(ErrorCode::Timeout));
    assert!(err.message.contains(CHECKPOINT_DELETE_RESOURCES));
    assert_eq!(store.snapshot().len(), 1);
}

#[tokio::test]
async fn abort_interrupts_a_stuck_group() {
    let store = Arc::new(MemStore::new());
    let di = create_typed(store.as_ref(), &item()).await.unwrap();
    let mut stuck = obj("v1", "ConfigMap", Some("default"), "stuck");
    stuck.metadata.finalizers = Some(vec!["example.com/hold".into()]);
    let cm = seed(&store, stuck, ManagedResourcePolicy::Manage).await;

    let abort = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut current: DeployItem = get_typed(store.as_ref(), "default", "web").await.unwrap();
            meta::set_annotation(&mut current.metadata, annotations::OPERATION, "abort");
            update_typed(store.as_ref(), &current).await.unwrap();
        })
    };

    let shared: Arc<dyn ClusterStore> = store.clone();
    let interruption = StoreInterruptionChecker::new(shared, &di);
    let err = Teardown::new(store.as_ref(), &di, &IgnoreTimeoutChecker::default(), &interruption)
        .with_interval(FAST)
        .delete_managed_resources(&[cm], &[])
        .await
        .unwrap_err();
    abort.await.unwrap();
    assert_eq!(err.reason, rudder_core::interruption::REASON_INTERRUPTED);
}
