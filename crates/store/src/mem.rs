use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::DynamicObject;
use rudder_core::{ClusterStore, Labels, StoreError, TypeRef, WatchEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

const BUILTIN_CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole.rbac.authorization.k8s.io",
    "ClusterRoleBinding.rbac.authorization.k8s.io",
    "CustomResourceDefinition.apiextensions.k8s.io",
    "StorageClass.storage.k8s.io",
    "CSIDriver.storage.k8s.io",
    "PriorityClass.scheduling.k8s.io",
    "IngressClass.networking.k8s.io",
    "RuntimeClass.node.k8s.io",
    "ValidatingWebhookConfiguration.admissionregistration.k8s.io",
    "MutatingWebhookConfiguration.admissionregistration.k8s.io",
    "APIService.apiregistration.k8s.io",
];

/// Store operations, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    group_kind: String,
    namespace: String,
    name: String,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<Key, DynamicObject>,
    resource_version: u64,
    cluster_scoped: FxHashSet<String>,
    unserved: FxHashSet<String>,
    failures: FxHashMap<(Verb, String), StoreError>,
    mutations: u64,
    journal: Vec<(Verb, String)>,
}

/// In-memory [`ClusterStore`] with resource versions, finalizer-aware deletes and watch fan-out.
///
/// Every mutation is journaled as `(verb, "Kind ns/name")` so tests can assert on ordering.
pub struct MemStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<(String, WatchEvent)>,
}

impl Default for MemStore {
    fn default() -> Self { Self::new() }
}

impl MemStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        let inner = Inner { cluster_scoped: BUILTIN_CLUSTER_SCOPED.iter().map(|s| s.to_string()).collect(), ..Default::default() };
        Self { inner: Mutex::new(inner), events }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> { self.inner.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn register_cluster_scoped(&self, type_ref: &TypeRef) {
        self.lock().cluster_scoped.insert(type_ref.group_kind());
    }

    /// Make a kind unknown to the store; every call on it yields `NoMatch`.
    pub fn unserve(&self, type_ref: &TypeRef) {
        self.lock().unserved.insert(type_ref.group_kind());
    }

    /// Fail the next `verb` on objects of `kind` with `err`.
    pub fn fail_next(&self, verb: Verb, kind: &str, err: StoreError) {
        self.lock().failures.insert((verb, kind.to_string()), err);
    }

    /// Number of successful mutating calls.
    pub fn mutations(&self) -> u64 { self.lock().mutations }

    pub fn journal(&self) -> Vec<(Verb, String)> { self.lock().journal.clone() }

    pub fn clear_journal(&self) { self.lock().journal.clear(); }

    /// Every stored object, ordered by kind, namespace and name.
    pub fn snapshot(&self) -> Vec<DynamicObject> {
        let inner = self.lock();
        let mut all: Vec<(&Key, &DynamicObject)> = inner.objects.iter().collect();
        all.sort_by(|a, b| (&a.0.group_kind, &a.0.namespace, &a.0.name).cmp(&(&b.0.group_kind, &b.0.namespace, &b.0.name)));
        all.into_iter().map(|(_, o)| o.clone()).collect()
    }

    fn emit(&self, group_kind: &str, ev: WatchEvent) {
        // No receivers is fine.
        let _ = self.events.send((group_kind.to_string(), ev));
    }
}

impl Inner {
    fn check(&mut self, verb: Verb, type_ref: &TypeRef) -> Result<(), StoreError> {
        let gk = type_ref.group_kind();
        if self.unserved.contains(&gk) { return Err(StoreError::NoMatch(type_ref.to_string())); }
        if let Some(err) = self.failures.remove(&(verb, type_ref.kind.clone())) { return Err(err); }
        Ok(())
    }

    fn key(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<Key, StoreError> {
        let group_kind = type_ref.group_kind();
        let namespace = if self.cluster_scoped.contains(&group_kind) {
            String::new()
        } else {
            match namespace {
                Some(ns) if !ns.is_empty() => ns.to_string(),
                _ => return Err(StoreError::Invalid(format!("namespace required for {} {}", type_ref, name))),
            }
        };
        Ok(Key { group_kind, namespace, name: name.to_string() })
    }

    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn record(&mut self, verb: Verb, key: &Key) {
        self.mutations += 1;
        let kind = key.group_kind.split('.').next().unwrap_or_default();
        let what = if key.namespace.is_empty() { format!("{} {}", kind, key.name) } else { format!("{} {}/{}", kind, key.namespace, key.name) };
        self.journal.push((verb, what));
    }

    /// CRDs define new kinds; remember their scope.
    fn learn_crd(&mut self, obj: &DynamicObject) {
        let spec = &obj.data["spec"];
        let (Some(group), Some(kind)) = (spec["group"].as_str(), spec["names"]["kind"].as_str()) else { return };
        if spec["scope"].as_str() == Some("Cluster") {
            self.cluster_scoped.insert(format!("{}.{}", kind, group));
        }
    }
}

fn split_status(data: &Json) -> (Json, Option<Json>) {
    let mut body = data.clone();
    let status = body.as_object_mut().and_then(|o| o.remove("status"));
    (body, status)
}

fn labels_match(meta: &ObjectMeta, selector: Option<&Labels>) -> bool {
    let Some(sel) = selector else { return true };
    let labels = meta.labels.as_ref();
    sel.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

fn check_version(stored: &DynamicObject, incoming: &DynamicObject, what: &str) -> Result<(), StoreError> {
    match incoming.metadata.resource_version.as_deref() {
        Some(rv) if !rv.is_empty() && Some(rv) != stored.metadata.resource_version.as_deref() => Err(StoreError::Conflict(format!(
            "{}: resourceVersion {} is stale (current {})",
            what,
            rv,
            stored.metadata.resource_version.as_deref().unwrap_or("")
        ))),
        _ => Ok(()),
    }
}

#[async_trait::async_trait]
impl ClusterStore for MemStore {
    async fn get(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        inner.check(Verb::Get, type_ref)?;
        let key = inner.key(type_ref, namespace, name)?;
        inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(format!("{} {}", type_ref, name)))
    }

    async fn get_metadata(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<ObjectMeta, StoreError> {
        Ok(self.get(type_ref, namespace, name).await?.metadata)
    }

    async fn list(&self, type_ref: &TypeRef, namespace: Option<&str>, labels: Option<&Labels>) -> Result<Vec<DynamicObject>, StoreError> {
        let mut inner = self.lock();
        inner.check(Verb::List, type_ref)?;
        let gk = type_ref.group_kind();
        let cluster_scoped = inner.cluster_scoped.contains(&gk);
        let mut out: Vec<(&Key, &DynamicObject)> = inner
            .objects
            .iter()
            .filter(|(k, _)| k.group_kind == gk)
            .filter(|(k, _)| cluster_scoped || namespace.map_or(true, |ns| k.namespace == ns))
            .filter(|(_, o)| labels_match(&o.metadata, labels))
            .collect();
        out.sort_by(|a, b| (&a.0.namespace, &a.0.name).cmp(&(&b.0.namespace, &b.0.name)));
        Ok(out.into_iter().map(|(_, o)| o.clone()).collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let type_ref = TypeRef::of(obj)?;
        let name = obj.metadata.name.clone().ok_or_else(|| StoreError::Invalid(format!("{} without name", type_ref)))?;
        let stored = {
            let mut inner = self.lock();
            inner.check(Verb::Create, &type_ref)?;
            let key = inner.key(&type_ref, obj.metadata.namespace.as_deref(), &name)?;
            if inner.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(format!("{} {}", type_ref, name)));
            }
            let mut stored = obj.clone();
            stored.metadata.namespace = if key.namespace.is_empty() { None } else { Some(key.namespace.clone()) };
            stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            stored.metadata.creation_timestamp = Some(Time(Utc::now()));
            stored.metadata.deletion_timestamp = None;
            stored.metadata.generation = Some(1);
            stored.metadata.resource_version = Some(inner.next_version());
            if type_ref.kind == "CustomResourceDefinition" { inner.learn_crd(&stored); }
            inner.record(Verb::Create, &key);
            inner.objects.insert(key, stored.clone());
            stored
        };
        trace!(kind = %type_ref.kind, name = %name, "mem: created");
        self.emit(&type_ref.group_kind(), WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let type_ref = TypeRef::of(obj)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let (result, removed) = {
            let mut inner = self.lock();
            inner.check(Verb::Update, &type_ref)?;
            let key = inner.key(&type_ref, obj.metadata.namespace.as_deref(), &name)?;
            let Some(current) = inner.objects.get(&key).cloned() else {
                return Err(StoreError::NotFound(format!("{} {}", type_ref, name)));
            };
            check_version(&current, obj, &format!("{} {}", type_ref, name))?;

            let (cur_body, cur_status) = split_status(&current.data);
            let (new_body, _) = split_status(&obj.data);
            let mut next = obj.clone();
            next.data = new_body.clone();
            if let (Some(map), Some(status)) = (next.data.as_object_mut(), cur_status) {
                map.insert("status".into(), status);
            }
            next.metadata.namespace = current.metadata.namespace.clone();
            next.metadata.uid = current.metadata.uid.clone();
            next.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
            next.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
            let generation = current.metadata.generation.unwrap_or(1);
            next.metadata.generation = Some(if new_body != cur_body { generation + 1 } else { generation });
            next.metadata.resource_version = Some(inner.next_version());
            inner.record(Verb::Update, &key);

            let finalizers_empty = next.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
            if next.metadata.deletion_timestamp.is_some() && finalizers_empty {
                inner.objects.remove(&key);
                (next, true)
            } else {
                inner.objects.insert(key, next.clone());
                (next, false)
            }
        };
        let gk = type_ref.group_kind();
        if removed {
            debug!(kind = %type_ref.kind, name = %name, "mem: last finalizer removed; object deleted");
            self.emit(&gk, WatchEvent::Deleted(result.clone()));
        } else {
            self.emit(&gk, WatchEvent::Applied(result.clone()));
        }
        Ok(result)
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let type_ref = TypeRef::of(obj)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let next = {
            let mut inner = self.lock();
            inner.check(Verb::UpdateStatus, &type_ref)?;
            let key = inner.key(&type_ref, obj.metadata.namespace.as_deref(), &name)?;
            let Some(current) = inner.objects.get(&key).cloned() else {
                return Err(StoreError::NotFound(format!("{} {}", type_ref, name)));
            };
            check_version(&current, obj, &format!("{} {}", type_ref, name))?;
            let mut next = current;
            let (_, status) = split_status(&obj.data);
            if let Some(map) = next.data.as_object_mut() {
                match status {
                    Some(s) => { map.insert("status".into(), s); }
                    None => { map.remove("status"); }
                }
            }
            next.metadata.resource_version = Some(inner.next_version());
            inner.record(Verb::UpdateStatus, &key);
            inner.objects.insert(key, next.clone());
            next
        };
        self.emit(&type_ref.group_kind(), WatchEvent::Applied(next.clone()));
        Ok(next)
    }

    async fn delete(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let event = {
            let mut inner = self.lock();
            inner.check(Verb::Delete, type_ref)?;
            let key = inner.key(type_ref, namespace, name)?;
            let Some(mut current) = inner.objects.get(&key).cloned() else {
                return Err(StoreError::NotFound(format!("{} {}", type_ref, name)));
            };
            inner.record(Verb::Delete, &key);
            let has_finalizers = current.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty());
            if has_finalizers {
                if current.metadata.deletion_timestamp.is_some() { return Ok(()); }
                current.metadata.deletion_timestamp = Some(Time(Utc::now()));
                current.metadata.resource_version = Some(inner.next_version());
                inner.objects.insert(key, current.clone());
                WatchEvent::Applied(current)
            } else {
                inner.objects.remove(&key);
                WatchEvent::Deleted(current)
            }
        };
        self.emit(&type_ref.group_kind(), event);
        Ok(())
    }

    async fn is_namespaced(&self, type_ref: &TypeRef) -> Result<bool, StoreError> {
        let inner = self.lock();
        let gk = type_ref.group_kind();
        if inner.unserved.contains(&gk) { return Err(StoreError::NoMatch(type_ref.to_string())); }
        Ok(!inner.cluster_scoped.contains(&gk))
    }

    async fn watch(&self, type_ref: &TypeRef, namespace: Option<&str>, tx: mpsc::Sender<WatchEvent>) -> Result<(), StoreError> {
        let gk = type_ref.group_kind();
        let mut rx = self.events.subscribe();
        let initial = self.list(type_ref, namespace, None).await?;
        if tx.send(WatchEvent::Restarted(initial)).await.is_err() { return Ok(()); }
        let in_scope = |o: &DynamicObject| namespace.map_or(true, |ns| o.metadata.namespace.as_deref().map_or(true, |n| n == ns));
        loop {
            match rx.recv().await {
                Ok((kind, ev)) if kind == gk => {
                    let keep = match &ev {
                        WatchEvent::Applied(o) | WatchEvent::Deleted(o) => in_scope(o),
                        WatchEvent::Restarted(_) => true,
                    };
                    if keep && tx.send(ev).await.is_err() { return Ok(()); }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "mem: watch lagged; relisting");
                    let relist = self.list(type_ref, namespace, None).await?;
                    if tx.send(WatchEvent::Restarted(relist)).await.is_err() { return Ok(()); }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}
