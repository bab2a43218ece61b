//! The cluster store contract: a versioned object store with optimistic concurrency.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, GroupVersionKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{LsError, StoreError};
use crate::item::ResolvedTarget;

pub type Labels = BTreeMap<String, String>;

/// apiVersion + kind of an object type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRef {
    pub api_version: String,
    pub kind: String,
}

impl TypeRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    pub fn group(&self) -> &str { self.api_version.split_once('/').map(|(g, _)| g).unwrap_or("") }

    pub fn version(&self) -> &str { self.api_version.split_once('/').map(|(_, v)| v).unwrap_or(&self.api_version) }

    /// `Kind.group`, or `Kind` for the core group.
    pub fn group_kind(&self) -> String {
        let g = self.group();
        if g.is_empty() { self.kind.clone() } else { format!("{}.{}", self.kind, g) }
    }

    pub fn gvk(&self) -> GroupVersionKind { GroupVersionKind::gvk(self.group(), self.version(), &self.kind) }

    pub fn of(obj: &DynamicObject) -> Result<TypeRef, StoreError> {
        let types = obj.types.as_ref().ok_or_else(|| StoreError::Invalid(format!("object {} has no apiVersion/kind", obj.metadata.name.as_deref().unwrap_or("?"))))?;
        Ok(TypeRef::new(types.api_version.clone(), types.kind.clone()))
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.api_version, self.kind) }
}

/// Reference to a single object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ObjectRef {
    pub fn new(type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: type_ref.api_version.clone(),
            kind: type_ref.kind.clone(),
            namespace: namespace.filter(|n| !n.is_empty()).map(|n| n.to_string()),
            name: name.to_string(),
            uid: None,
        }
    }

    pub fn from_object(obj: &DynamicObject) -> Result<Self, StoreError> {
        let t = TypeRef::of(obj)?;
        let name = obj.metadata.name.as_deref().ok_or_else(|| StoreError::Invalid(format!("{} object without name", t)))?;
        let mut r = ObjectRef::new(&t, obj.metadata.namespace.as_deref(), name);
        r.uid = obj.metadata.uid.clone();
        Ok(r)
    }

    pub fn type_ref(&self) -> TypeRef { TypeRef::new(self.api_version.clone(), self.kind.clone()) }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    /// Same object: equal UIDs when both are known, otherwise equal type, namespace and name.
    pub fn same_object(&self, other: &ObjectRef) -> bool {
        if let (Some(a), Some(b)) = (self.uid.as_deref(), other.uid.as_deref()) {
            if !a.is_empty() && !b.is_empty() { return a == b; }
        }
        self.api_version == other.api_version && self.kind == other.kind && self.namespace == other.namespace && self.name == other.name
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Change notification, mirroring the list+watch event shape.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
    Restarted(Vec<DynamicObject>),
}

/// Versioned object store shared by all controller replicas.
///
/// `update` and `update_status` carry the caller's `resourceVersion`; a stale version yields
/// [`StoreError::Conflict`]. Deleting an object that still has finalizers only marks it with a
/// deletion timestamp.
#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<DynamicObject, StoreError>;

    /// Metadata-only read.
    async fn get_metadata(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<ObjectMeta, StoreError>;

    /// List objects of a type. `namespace = None` lists across all namespaces.
    async fn list(&self, type_ref: &TypeRef, namespace: Option<&str>, labels: Option<&Labels>) -> Result<Vec<DynamicObject>, StoreError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace everything but the status.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Replace only the status.
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    async fn delete(&self, type_ref: &TypeRef, namespace: Option<&str>, name: &str) -> Result<(), StoreError>;

    async fn is_namespaced(&self, type_ref: &TypeRef) -> Result<bool, StoreError>;

    /// Stream changes of a type into `tx` until the sender side is closed or the watch ends.
    async fn watch(&self, type_ref: &TypeRef, namespace: Option<&str>, tx: mpsc::Sender<WatchEvent>) -> Result<(), StoreError>;
}

/// Opens a store on the cluster a target points to.
#[async_trait::async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, target: Option<&ResolvedTarget>) -> Result<Arc<dyn ClusterStore>, LsError>;
}

/// Hands out the same store for every target.
#[derive(Clone)]
pub struct StaticConnector(pub Arc<dyn ClusterStore>);

#[async_trait::async_trait]
impl ClusterConnector for StaticConnector {
    async fn connect(&self, _target: Option<&ResolvedTarget>) -> Result<Arc<dyn ClusterStore>, LsError> { Ok(Arc::clone(&self.0)) }
}

/// Typed records persisted through a [`ClusterStore`].
pub trait StoreObject: Serialize + DeserializeOwned + Clone + Send + Sync {
    const API_VERSION: &'static str;
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn type_ref() -> TypeRef { TypeRef::new(Self::API_VERSION, Self::KIND) }

    fn to_dynamic(&self) -> Result<DynamicObject, StoreError> {
        let mut v = serde_json::to_value(self).map_err(|e| StoreError::Invalid(e.to_string()))?;
        if let Some(obj) = v.as_object_mut() {
            obj.insert("apiVersion".into(), Self::API_VERSION.into());
            obj.insert("kind".into(), Self::KIND.into());
        }
        serde_json::from_value(v).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    fn from_dynamic(obj: &DynamicObject) -> Result<Self, StoreError> {
        let v = serde_json::to_value(obj).map_err(|e| StoreError::Invalid(e.to_string()))?;
        serde_json::from_value(v).map_err(|e| StoreError::Invalid(format!("decoding {}: {}", Self::KIND, e)))
    }
}

pub async fn get_typed<T: StoreObject>(store: &dyn ClusterStore, namespace: &str, name: &str) -> Result<T, StoreError> {
    let obj = store.get(&T::type_ref(), Some(namespace), name).await?;
    T::from_dynamic(&obj)
}

pub async fn create_typed<T: StoreObject>(store: &dyn ClusterStore, obj: &T) -> Result<T, StoreError> {
    let created = store.create(&obj.to_dynamic()?).await?;
    T::from_dynamic(&created)
}

pub async fn update_typed<T: StoreObject>(store: &dyn ClusterStore, obj: &T) -> Result<T, StoreError> {
    let updated = store.update(&obj.to_dynamic()?).await?;
    T::from_dynamic(&updated)
}

pub async fn update_status_typed<T: StoreObject>(store: &dyn ClusterStore, obj: &T) -> Result<T, StoreError> {
    let updated = store.update_status(&obj.to_dynamic()?).await?;
    T::from_dynamic(&updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::DeployItem;

    #[test]
    fn type_ref_splits_group_and_version() {
        let t = TypeRef::new("apps/v1", "Deployment");
        assert_eq!(t.group(), "apps");
        assert_eq!(t.version(), "v1");
        assert_eq!(t.group_kind(), "Deployment.apps");
        let core = TypeRef::new("v1", "Pod");
        assert_eq!(core.group(), "");
        assert_eq!(core.version(), "v1");
        assert_eq!(core.group_kind(), "Pod");
    }

    #[test]
    fn same_object_prefers_uid() {
        let t = TypeRef::new("v1", "ServiceAccount");
        let mut a = ObjectRef::new(&t, Some("ns"), "sa");
        let mut b = a.clone();
        assert!(a.same_object(&b));
        a.uid = Some("1".into());
        b.uid = Some("2".into());
        assert!(!a.same_object(&b), "recreated object is a different object");
        b.uid = None;
        assert!(a.same_object(&b));
    }

    #[test]
    fn typed_dynamic_conversion_keeps_spec_and_status() {
        let mut di = DeployItem::new("ns", "x", "manifest");
        di.status.job_id = "7".into();
        let dynamic = di.to_dynamic().unwrap();
        assert_eq!(TypeRef::of(&dynamic).unwrap(), DeployItem::type_ref());
        assert_eq!(dynamic.data["spec"]["type"], "manifest");
        let back = DeployItem::from_dynamic(&dynamic).unwrap();
        assert_eq!(back, di);
    }
}
