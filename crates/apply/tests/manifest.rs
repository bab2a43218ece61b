#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use rudder_apply::{ManifestDeployer, ProviderStatus, DEPLOYER_TYPE};
use rudder_core::store::{create_typed, get_typed, update_status_typed, update_typed, StaticConnector};
use rudder_core::{ClusterStore, DeployItem, ErrorCode, Phase, StoreObject, TypeRef, MANAGED_BY_LABEL};
use rudder_engine::{Controller, EngineConfig, ItemKey};
use rudder_store::MemStore;
use serde_json::{json, Value};

const FAST: Duration = Duration::from_millis(5);

struct Env {
    store: Arc<MemStore>,
    controller: Controller,
}

impl Env {
    fn new() -> Self {
        let store = Arc::new(MemStore::new());
        let deployer = ManifestDeployer::new(Arc::new(StaticConnector(store.clone()))).with_poll_interval(FAST);
        let config = EngineConfig { identity: "test".into(), ..EngineConfig::new(DEPLOYER_TYPE) };
        let controller = Controller::new(config, store.clone(), Arc::new(deployer));
        Self { store, controller }
    }

    async fn submit(&self, name: &str, configuration: Value) -> ItemKey {
        let mut di = DeployItem::new("default", name, DEPLOYER_TYPE);
        di.spec.configuration = configuration;
        di.status.job_id = "1".into();
        create_typed(self.store.as_ref(), &di).await.unwrap();
        ItemKey::new("default", name)
    }

    async fn get(&self, key: &ItemKey) -> DeployItem { get_typed(self.store.as_ref(), &key.namespace, &key.name).await.unwrap() }

    async fn new_job(&self, key: &ItemKey, job: &str, configuration: Option<Value>) {
        let mut di = self.get(key).await;
        if let Some(c) = configuration {
            di.spec.configuration = c;
            di.metadata = update_typed(self.store.as_ref(), &di).await.unwrap().metadata;
        }
        di.status.job_id = job.into();
        update_status_typed(self.store.as_ref(), &di).await.unwrap();
    }

    async fn exists(&self, api_version: &str, kind: &str, ns: Option<&str>, name: &str) -> bool {
        match self.store.get(&TypeRef::new(api_version, kind), ns, name).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => panic!("{e}"),
        }
    }
}

fn manifest(api_version: &str, kind: &str, name: &str) -> Value {
    json!({"policy": "manage", "manifest": {"apiVersion": api_version, "kind": kind, "metadata": {"name": name}}})
}

fn accounts_and_roles(names: &[&str]) -> Value {
    let mut manifests = Vec::new();
    for n in names {
        manifests.push(manifest("v1", "ServiceAccount", &format!("sa-{n}")));
        manifests.push(manifest("rbac.authorization.k8s.io/v1", "ClusterRole", &format!("role-{n}")));
    }
    json!({
        "manifests": manifests,
        "deletionGroups": [{"predefinedResourceGroup": {"type": "cluster-scoped-resources"}}],
    })
}

#[tokio::test]
async fn install_update_and_uninstall() {
    let env = Env::new();
    let key = env.submit("rbac", accounts_and_roles(&["a", "b"])).await;
    env.controller.reconcile(&key).await.unwrap();

    let di = env.get(&key).await;
    assert_eq!(di.status.phase, Some(Phase::Succeeded), "{:?}", di.status.last_error);
    let status = ProviderStatus::from_item(&di).unwrap();
    assert_eq!(status.managed_resources.len(), 4);
    let sa = env.store.get_metadata(&TypeRef::new("v1", "ServiceAccount"), Some("default"), "sa-a").await.unwrap();
    assert_eq!(sa.labels.unwrap().get(MANAGED_BY_LABEL).map(String::as_str), Some("rbac"));

    // Dropping "b" from the list removes its objects on the next job.
    env.new_job(&key, "2", Some(accounts_and_roles(&["a"]))).await;
    env.controller.reconcile(&key).await.unwrap();
    let di = env.get(&key).await;
    assert_eq!(di.status.phase, Some(Phase::Succeeded), "{:?}", di.status.last_error);
    assert_eq!(ProviderStatus::from_item(&di).unwrap().managed_resources.len(), 2);
    assert!(!env.exists("v1", "ServiceAccount", Some("default"), "sa-b").await);
    assert!(!env.exists("rbac.authorization.k8s.io/v1", "ClusterRole", None, "role-b").await);
    assert!(env.exists("v1", "ServiceAccount", Some("default"), "sa-a").await);

    env.store.clear_journal();
    env.store.delete(&DeployItem::type_ref(), Some("default"), "rbac").await.unwrap();
    env.controller.reconcile(&key).await.unwrap();
    assert!(!env.exists("v1", "ServiceAccount", Some("default"), "sa-a").await);
    assert!(!env.exists("rbac.authorization.k8s.io/v1", "ClusterRole", None, "role-a").await);
    assert!(env.store.get(&DeployItem::type_ref(), Some("default"), "rbac").await.unwrap_err().is_not_found());

    // Cluster-scoped group first, the namespaced account in the trailing group.
    let deletes: Vec<String> = env.store.journal().into_iter().filter(|(v, _)| *v == rudder_store::Verb::Delete).map(|(_, w)| w).collect();
    let role = deletes.iter().position(|w| w == "ClusterRole role-a").unwrap();
    let account = deletes.iter().position(|w| w == "ServiceAccount default/sa-a").unwrap();
    assert!(role < account, "{deletes:?}");
}

#[tokio::test]
async fn custom_readiness_check_gates_success() {
    let env = Env::new();
    let config = |ready: &str| {
        json!({
            "manifests": [{"manifest": {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "flag"}, "data": {"ready": ready}}}],
            "readinessChecks": {
                "timeout": "100ms",
                "customReadinessChecks": [{
                    "name": "flag-set",
                    "resource": [{"apiVersion": "v1", "kind": "ConfigMap", "namespace": "default", "name": "flag"}],
                    "requirements": [{"jsonPath": ".data.ready", "operator": "=", "values": [{"value": "true"}]}]
                }]
            }
        })
    };
    let key = env.submit("gated", config("false")).await;
    env.controller.reconcile(&key).await.unwrap();
    let di = env.get(&key).await;
    assert_eq!(di.status.phase, Some(Phase::Progressing));
    assert!(di.status.last_error.unwrap().has_code(ErrorCode::HealthCheckTimeout));

    env.new_job(&key, "1", Some(config("true"))).await;
    env.controller.reconcile(&key).await.unwrap();
    let di = env.get(&key).await;
    assert_eq!(di.status.phase, Some(Phase::Succeeded), "{:?}", di.status.last_error);
}

#[tokio::test]
async fn invalid_configuration_fails_without_touching_the_cluster() {
    let env = Env::new();
    let key = env.submit("broken", json!({"manifests": [{"manifest": {"kind": "ConfigMap"}}]})).await;
    env.controller.reconcile(&key).await.unwrap();
    let di = env.get(&key).await;
    assert_eq!(di.status.phase, Some(Phase::Failed));
    let err = di.status.last_error.unwrap();
    assert!(err.has_code(ErrorCode::ConfigurationProblem));
    assert!(err.message.contains("missing apiVersion"), "{}", err.message);
    assert!(env.store.snapshot().iter().all(|o| o.types.as_ref().is_some_and(|t| t.kind != "ConfigMap")));
}
