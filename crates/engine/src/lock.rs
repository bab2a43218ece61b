//! Cluster-visible, crash-recoverable lock per deploy item.
//!
//! A lock is a `SyncObject` named `di-<uid>` next to the item. Whoever creates it first holds it.
//! An empty holder means free. A lock whose `lastUpdateTime` is older than `stale_after` is treated
//! as abandoned and may be taken over. Takeovers go through a versioned update, so two replicas
//! racing for the same lock cannot both win.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rudder_core::store::{create_typed, get_typed, update_typed};
use rudder_core::{Clock, ClusterStore, DeployItem, LsError, StoreError, StoreObject, SyncObject, SyncObjectSpec};
use tracing::{debug, info, warn};

use crate::controller::ReconcileResult;

pub struct Locker {
    store: Arc<dyn ClusterStore>,
    identity: String,
    stale_after: Duration,
    retry_after: Duration,
    clock: Arc<dyn Clock>,
}

fn lock_error(reason: &str, e: StoreError) -> LsError { LsError::wrap("Lock", reason, e) }

impl Locker {
    pub fn new(store: Arc<dyn ClusterStore>, identity: impl Into<String>, stale_after: Duration, retry_after: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { store, identity: identity.into(), stale_after, retry_after, clock }
    }

    pub fn identity(&self) -> &str { &self.identity }

    fn is_stale(&self, lock: &SyncObject) -> bool {
        (self.clock.now() - lock.spec.last_update_time).to_std().map_or(false, |age| age >= self.stale_after)
    }

    /// Acquire the lock of the item described by `meta`.
    ///
    /// `Ok(None)` means another holder has it; retry later.
    pub async fn lock(&self, meta: &ObjectMeta) -> Result<Option<SyncObject>, LsError> {
        let uid = meta.uid.as_deref().unwrap_or_default();
        let namespace = meta.namespace.clone().unwrap_or_default();
        let item_name = meta.name.clone().unwrap_or_default();
        let name = SyncObject::name_for(uid);
        let now = self.clock.now();

        let fresh = SyncObject {
            metadata: ObjectMeta { name: Some(name.clone()), namespace: Some(namespace.clone()), ..Default::default() },
            spec: SyncObjectSpec { holder: self.identity.clone(), kind: DeployItem::KIND.to_string(), name: item_name.clone(), last_update_time: now },
        };
        match create_typed(self.store.as_ref(), &fresh).await {
            Ok(created) => {
                debug!(item = %format!("{namespace}/{item_name}"), lock = %name, "lock created");
                return Ok(Some(created));
            }
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(lock_error("CreateSyncObject", e)),
        }

        let mut current: SyncObject = match get_typed(self.store.as_ref(), &namespace, &name).await {
            Ok(o) => o,
            // Released and cleaned up between our create and get; the next attempt creates it.
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(lock_error("GetSyncObject", e)),
        };

        let ours = current.spec.holder == self.identity;
        let reclaim = !ours && !current.is_free() && self.is_stale(&current);
        if !ours && !current.is_free() && !reclaim {
            debug!(item = %format!("{namespace}/{item_name}"), holder = %current.spec.holder, "lock held elsewhere");
            metrics::counter!("rudder_lock_contended_total", 1u64);
            return Ok(None);
        }
        if reclaim {
            info!(item = %format!("{namespace}/{item_name}"), previous = %current.spec.holder, "reclaiming stale lock");
            metrics::counter!("rudder_lock_reclaimed_total", 1u64);
        }

        current.spec.holder = self.identity.clone();
        current.spec.last_update_time = now;
        match update_typed(self.store.as_ref(), &current).await {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(item = %format!("{namespace}/{item_name}"), "lock taken concurrently");
                metrics::counter!("rudder_lock_contended_total", 1u64);
                Ok(None)
            }
            Err(e) => Err(lock_error("UpdateSyncObject", e)),
        }
    }

    /// Release a lock. Failures are logged; the lock then expires through staleness.
    pub async fn unlock(&self, lock: &SyncObject) {
        let mut released = lock.clone();
        released.spec.holder.clear();
        released.spec.last_update_time = self.clock.now();
        if let Err(e) = update_typed(self.store.as_ref(), &released).await {
            if !e.is_not_found() {
                warn!(lock = %rudder_core::meta::key(&lock.metadata), error = %e, "failed to release lock");
            }
        }
    }

    pub fn not_locked_result(&self) -> ReconcileResult { ReconcileResult::requeue(self.retry_after) }

    /// Remove locks whose item is gone or was recreated under a new uid. Returns the number removed.
    pub async fn cleanup_orphans(&self, namespace: Option<&str>) -> Result<usize, LsError> {
        let locks = self.store.list(&SyncObject::type_ref(), namespace, None).await.map_err(|e| lock_error("ListSyncObjects", e))?;
        let mut removed = 0;
        for obj in locks {
            let lock = match SyncObject::from_dynamic(&obj) {
                Ok(l) => l,
                Err(e) => {
                    warn!(lock = %rudder_core::meta::key(&obj.metadata), error = %e, "skipping undecodable sync object");
                    continue;
                }
            };
            let ns = lock.metadata.namespace.clone().unwrap_or_default();
            let orphaned = match self.store.get_metadata(&DeployItem::type_ref(), Some(&ns), &lock.spec.name).await {
                Ok(m) => SyncObject::name_for(m.uid.as_deref().unwrap_or_default()) != lock.metadata.name.clone().unwrap_or_default(),
                Err(e) if e.is_not_found() => true,
                Err(e) => return Err(lock_error("GetDeployItem", e)),
            };
            if !orphaned { continue; }
            match self.store.delete(&SyncObject::type_ref(), Some(&ns), lock.metadata.name.as_deref().unwrap_or_default()).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(lock_error("DeleteSyncObject", e)),
            }
        }
        if removed > 0 { info!(removed, "removed orphaned locks"); }
        Ok(removed)
    }
}
