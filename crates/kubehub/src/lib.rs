//! Rudder kubehub: the cluster store over a live API server, target connectors and events.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, TypeMeta},
    discovery::{self, Scope},
    runtime::events::{Event as KubeEvent, EventType as KubeEventType, Recorder, Reporter},
    runtime::watcher::{self, Event},
    Client, Config,
};
use rudder_core::{
    ClusterConnector, ClusterStore, DeployItem, EventRecorder, EventType, Labels, LsError, ResolvedTarget, StoreError,
    StoreObject, TypeRef, WatchEvent,
};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Map an API error onto the store taxonomy.
pub fn map_kube_error(err: kube::Error, what: &str) -> StoreError {
    match &err {
        kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
            (404, _) => StoreError::NotFound(format!("{}: {}", what, resp.message)),
            (409, "AlreadyExists") => StoreError::AlreadyExists(format!("{}: {}", what, resp.message)),
            (409, _) => StoreError::Conflict(format!("{}: {}", what, resp.message)),
            (400 | 422, _) => StoreError::Invalid(format!("{}: {}", what, resp.message)),
            _ => StoreError::Backend(format!("{}: {}", what, err)),
        },
        kube::Error::Discovery(_) => StoreError::NoMatch(format!("{}: {}", what, err)),
        _ => StoreError::Backend(format!("{}: {}", what, err)),
    }
}

fn labels_selector(labels: &Labels) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// [`ClusterStore`] backed by the API server, with discovery results cached per type.
pub struct KubeStore {
    client: Client,
    resources: RwLock<FxHashMap<TypeRef, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client, resources: RwLock::new(FxHashMap::default()) } }

    /// In-cluster config or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building default kube client")?;
        Ok(Self::new(client))
    }

    pub async fn from_kubeconfig(yaml: &str) -> Result<Self> {
        let kubeconfig = Kubeconfig::from_yaml(yaml).context("parsing kubeconfig")?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await.context("loading kubeconfig")?;
        let client = Client::try_from(config).context("building kube client")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client { &self.client }

    async fn resolve(&self, type_ref: &TypeRef) -> Result<(ApiResource, bool), StoreError> {
        if let Some(hit) = self.resources.read().await.get(type_ref) { return Ok(hit.clone()); }
        let (ar, caps) = discovery::pinned_kind(&self.client, &type_ref.gvk()).await.map_err(|e| match map_kube_error(e, &type_ref.to_string()) {
            // An unknown group answers 404 during discovery.
            StoreError::NotFound(m) => StoreError::NoMatch(m),
            other => other,
        })?;
        let entry = (ar, matches!(caps.scope, Scope::Namespaced));
        debug!(gvk = %type_ref, namespaced = entry.1, "resolved api resource");
        self.resources.write().await.insert(type_ref.clone(), entry.clone());
        Ok(entry)
    }

    async fn api(&self, type_ref: &TypeRef, namespace: Option<&str>) -> Result<(Api<DynamicObject>, ApiResource), StoreError> {
        let (ar, namespaced) = self.resolve(type_ref).await?;
        let api = match (namespaced, namespace.filter(|n| !n.is_empty())) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }

    async fn api_for(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String, String), StoreError> {
        let type_ref = TypeRef::of(obj)?;
        let name = obj.metadata.name.clone().ok_or_else(|| StoreError::Invalid(format!("{} without name", type_ref)))?;
        let (api, _) = self.api(&type_ref, obj.metadata.namespace.as_deref()).await?;
        let what = format!("{} {}", type_ref, name);
        Ok((api, name, what))
    }
}

/// List items come back without apiVersion/kind.
fn with_types(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    obj
}

#[async_trait::async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError> {
        let (api, ar) = self.api(type_ref, namespace).await?;
        let obj = api.get(name).await.map_err(|e| map_kube_error(e, &format!("{} {}", type_ref, name)))?;
        Ok(with_types(obj, &ar))
    }

    async fn get_metadata(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<ObjectMeta, StoreError> {
        let (api, _) = self.api(type_ref, namespace).await?;
        let partial = api.get_metadata(name).await.map_err(|e| map_kube_error(e, &format!("{} {}", type_ref, name)))?;
        Ok(partial.metadata)
    }

    async fn list(&self, type_ref: &TypeRef, namespace: Option<&str>, labels: Option<&Labels>) -> Result<Vec<DynamicObject>, StoreError> {
        let (api, ar) = self.api(type_ref, namespace).await?;
        let mut lp = ListParams::default();
        if let Some(sel) = labels.filter(|l| !l.is_empty()) {
            lp = lp.labels(&labels_selector(sel));
        }
        let list = api.list(&lp).await.map_err(|e| map_kube_error(e, &type_ref.to_string()))?;
        Ok(list.items.into_iter().map(|o| with_types(o, &ar)).collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (api, _, what) = self.api_for(obj).await?;
        metrics::counter!("rudder_kube_writes_total", 1u64);
        api.create(&PostParams::default(), obj).await.map_err(|e| map_kube_error(e, &what))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (api, name, what) = self.api_for(obj).await?;
        metrics::counter!("rudder_kube_writes_total", 1u64);
        api.replace(&name, &PostParams::default(), obj).await.map_err(|e| map_kube_error(e, &what))
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (api, name, what) = self.api_for(obj).await?;
        let body = serde_json::to_vec(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
        metrics::counter!("rudder_kube_writes_total", 1u64);
        api.replace_status(&name, &PostParams::default(), body).await.map_err(|e| map_kube_error(e, &what))
    }

    async fn delete(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let (api, _) = self.api(type_ref, namespace).await?;
        api.delete(name, &DeleteParams::background()).await.map_err(|e| map_kube_error(e, &format!("{} {}", type_ref, name)))?;
        Ok(())
    }

    async fn is_namespaced(&self, type_ref: &TypeRef) -> Result<bool, StoreError> { Ok(self.resolve(type_ref).await?.1) }

    async fn watch(&self, type_ref: &TypeRef, namespace: Option<&str>, tx: mpsc::Sender<WatchEvent>) -> Result<(), StoreError> {
        let (api, ar) = self.api(type_ref, namespace).await?;
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        info!(gvk = %type_ref, ns = ?namespace, "watcher started");
        while let Some(ev) = stream.try_next().await.map_err(|e| StoreError::Backend(format!("watch {}: {}", type_ref, e)))? {
            let ev = match ev {
                Event::Applied(o) => WatchEvent::Applied(with_types(o, &ar)),
                Event::Deleted(o) => WatchEvent::Deleted(with_types(o, &ar)),
                Event::Restarted(list) => {
                    debug!(count = list.len(), "watch restart");
                    WatchEvent::Restarted(list.into_iter().map(|o| with_types(o, &ar)).collect())
                }
            };
            if tx.send(ev).await.is_err() { return Ok(()); }
        }
        warn!(gvk = %type_ref, "watcher stream ended");
        Ok(())
    }
}

/// Connects to the cluster named by a target's kubeconfig, falling back to the home cluster.
pub struct KubeConnector {
    home: Arc<KubeStore>,
    cache: Mutex<FxHashMap<String, Arc<KubeStore>>>,
}

impl KubeConnector {
    pub fn new(home: Arc<KubeStore>) -> Self { Self { home, cache: Mutex::new(FxHashMap::default()) } }
}

#[async_trait::async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, target: Option<&ResolvedTarget>) -> Result<Arc<dyn ClusterStore>, LsError> {
        let kubeconfig = target.and_then(|t| t.content.as_deref().or_else(|| t.target.kubeconfig()));
        let Some(kubeconfig) = kubeconfig else { return Ok(self.home.clone()) };
        let mut cache = self.cache.lock().await;
        if let Some(store) = cache.get(kubeconfig) { return Ok(store.clone()); }
        let store = KubeStore::from_kubeconfig(kubeconfig)
            .await
            .map(Arc::new)
            .map_err(|e| LsError::configuration("ConnectTarget", "InvalidKubeconfig", format!("{:#}", e)))?;
        cache.insert(kubeconfig.to_string(), store.clone());
        Ok(store)
    }
}

/// Publishes `events.k8s.io` events on deploy items.
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller: &str, instance: Option<String>) -> Self {
        Self { client, reporter: Reporter { controller: controller.to_string(), instance } }
    }
}

fn reference(item: &DeployItem) -> ObjectReference {
    ObjectReference {
        api_version: Some(DeployItem::API_VERSION.to_string()),
        kind: Some(DeployItem::KIND.to_string()),
        name: item.metadata.name.clone(),
        namespace: item.metadata.namespace.clone(),
        uid: item.metadata.uid.clone(),
        resource_version: item.metadata.resource_version.clone(),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, item: &DeployItem, type_: EventType, reason: &str, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference(item));
        let ev = KubeEvent {
            type_: match type_ {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(ev).await {
            warn!(item = %item.key(), reason, error = %e, "publishing event failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "m".into(), reason: reason.into(), code })
    }

    #[test]
    fn maps_api_errors() {
        assert!(map_kube_error(api_err(404, "NotFound"), "x").is_not_found());
        assert!(map_kube_error(api_err(409, "AlreadyExists"), "x").is_already_exists());
        assert!(map_kube_error(api_err(409, "Conflict"), "x").is_conflict());
        assert!(matches!(map_kube_error(api_err(422, "Invalid"), "x"), StoreError::Invalid(_)));
        assert!(matches!(map_kube_error(api_err(500, "InternalError"), "x"), StoreError::Backend(_)));
    }

    #[test]
    fn builds_label_selector() {
        let labels: Labels = [("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())].into_iter().collect();
        assert_eq!(labels_selector(&labels), "a=1,b=2");
    }

    #[test]
    fn list_items_get_types() {
        let ar = ApiResource::from_gvk(&TypeRef::new("apps/v1", "Deployment").gvk());
        let mut bare = DynamicObject::new("d", &ar);
        bare.types = None;
        let obj = with_types(bare, &ar);
        assert_eq!(TypeRef::of(&obj).unwrap(), TypeRef::new("apps/v1", "Deployment"));
    }
}
