//! The deploy item state machine.
//!
//! One call of [`Controller::reconcile`] is one cycle for one item: cheap metadata read, cache and
//! responsibility checks, lock, full read, work detection, re-arm, finalizer, delegation to the
//! [`Deployer`], then result handling. Deployer failures end up in `status.lastError`; the call only
//! returns `Err` when nothing could be recorded.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rudder_core::events::LogEventRecorder;
use rudder_core::interruption::{InterruptionChecker, NoInterruption, StoreInterruptionChecker};
use rudder_core::store::{get_typed, update_status_typed, update_typed};
use rudder_core::timeout::{StandardTimeoutChecker, TimeoutChecker};
use rudder_core::{
    annotations, meta, phase_for_last_error, Clock, ClusterStore, DeployItem, DeployItemStatus, DeployerInformation, EventRecorder, EventType,
    LsError, Operation, Phase, ResolvedTarget, StoreError, StoreObject, SystemClock, TransitionTimes, FINALIZER,
};
use tracing::{debug, info, trace, warn};

use crate::cache::FinishedObjectCache;
use crate::config::EngineConfig;
use crate::deployer::{DeployContext, Deployer, StoreTargetResolver, TargetResolver};
use crate::hooks::{min_requeue, HookRegistry, HookResult, HookType};
use crate::lock::Locker;
use crate::responsibility;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub namespace: String,
    pub name: String,
}

impl ItemKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self { Self { namespace: namespace.into(), name: name.into() } }

    pub fn of(meta: &ObjectMeta) -> Self {
        Self::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone().unwrap_or_default())
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn done() -> Self { Self::default() }
    pub fn requeue(after: Duration) -> Self { Self { requeue_after: Some(after) } }

    /// Fold in the requeue request of a hook result.
    pub fn with_hook(self, hook: Option<HookResult>) -> Self {
        Self { requeue_after: min_requeue(self.requeue_after, hook.and_then(|h| h.requeue_after)) }
    }

    /// Earliest positive requeue of both.
    pub fn merge(self, other: ReconcileResult) -> Self { Self { requeue_after: min_requeue(self.requeue_after, other.requeue_after) } }
}

fn aborted(hook: Option<HookResult>) -> bool { hook.is_some_and(|h| h.abort_reconcile) }

fn store_error(reason: &str, e: StoreError) -> LsError { LsError::wrap("Reconcile", reason, e) }

pub struct Controller {
    config: EngineConfig,
    store: Arc<dyn ClusterStore>,
    deployer: Arc<dyn Deployer>,
    hooks: HookRegistry,
    resolver: Arc<dyn TargetResolver>,
    events: Arc<dyn EventRecorder>,
    clock: Arc<dyn Clock>,
    timeout: Option<Arc<dyn TimeoutChecker>>,
    cache: FinishedObjectCache,
}

impl Controller {
    pub fn new(config: EngineConfig, store: Arc<dyn ClusterStore>, deployer: Arc<dyn Deployer>) -> Self {
        let hooks = deployer.extension_hooks();
        let resolver = Arc::new(StoreTargetResolver::new(Arc::clone(&store)));
        Self {
            config,
            store,
            deployer,
            hooks,
            resolver,
            events: Arc::new(LogEventRecorder),
            clock: Arc::new(SystemClock),
            timeout: None,
            cache: FinishedObjectCache::default(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventRecorder>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the default budget check measured from `transitionTimes.initTime`.
    pub fn with_timeout_checker(mut self, checker: Arc<dyn TimeoutChecker>) -> Self {
        self.timeout = Some(checker);
        self
    }

    /// Run `extra` after the deployer's own hooks.
    pub fn with_hooks(mut self, extra: &HookRegistry) -> Self {
        self.hooks.merge(extra);
        self
    }

    pub fn config(&self) -> &EngineConfig { &self.config }
    pub fn store(&self) -> &Arc<dyn ClusterStore> { &self.store }
    pub fn cache(&self) -> &FinishedObjectCache { &self.cache }

    pub fn locker(&self) -> Locker {
        Locker::new(Arc::clone(&self.store), self.config.identity.clone(), self.config.lock_stale_after, self.config.lock_retry_after, Arc::clone(&self.clock))
    }

    fn timeout_checker(&self) -> Arc<dyn TimeoutChecker> {
        self.timeout.clone().unwrap_or_else(|| Arc::new(StandardTimeoutChecker::new(self.config.default_timeout, Arc::clone(&self.clock))))
    }

    fn requeue(&self) -> ReconcileResult { ReconcileResult::requeue(self.config.requeue_after) }

    pub async fn reconcile(&self, key: &ItemKey) -> Result<ReconcileResult, LsError> {
        let started = Instant::now();
        metrics::counter!("rudder_reconcile_total", 1u64);
        let res = self.reconcile_unlocked(key).await;
        let took_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("rudder_reconcile_latency_ms", took_ms);
        match &res {
            Ok(r) => trace!(item = %key, requeue = ?r.requeue_after, took_ms, "reconcile finished"),
            Err(e) => {
                metrics::counter!("rudder_reconcile_errors_total", 1u64);
                warn!(item = %key, op = %e.operation, reason = %e.reason, error = %e.message, "reconcile failed");
            }
        }
        res
    }

    async fn reconcile_unlocked(&self, key: &ItemKey) -> Result<ReconcileResult, LsError> {
        let start = self.hooks.execute(None, None, HookType::Start).await?;
        if aborted(start) { return Ok(ReconcileResult::done().with_hook(start)); }
        Ok(self.reconcile_started(key).await?.with_hook(start))
    }

    async fn reconcile_started(&self, key: &ItemKey) -> Result<ReconcileResult, LsError> {

        let meta = match self.store.get_metadata(&DeployItem::type_ref(), Some(&key.namespace), &key.name).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => {
                debug!(item = %key, "deploy item gone");
                self.cache.remove(&key.to_string());
                return Ok(ReconcileResult::done());
            }
            Err(e) => return Err(store_error("GetMetadata", e)),
        };
        // ShouldReconcile hooks may want to revive a finished item, so they bypass the cache.
        if self.hooks.len(HookType::ShouldReconcile) == 0 && self.cache.is_finished(&meta) {
            trace!(item = %key, "finished and unchanged");
            return Ok(ReconcileResult::done());
        }
        if responsibility::type_annotation_mismatch(&meta, &self.config.deployer_type) {
            trace!(item = %key, "deployer type annotation does not match");
            return Ok(ReconcileResult::done());
        }

        if !self.config.locking {
            return self.reconcile_locked(key, &meta).await;
        }
        let locker = self.locker();
        let Some(lock) = locker.lock(&meta).await? else {
            debug!(item = %key, "deploy item locked by another instance");
            return Ok(locker.not_locked_result());
        };
        let res = self.reconcile_locked(key, &meta).await;
        locker.unlock(&lock).await;
        res
    }

    async fn reconcile_locked(&self, key: &ItemKey, meta: &ObjectMeta) -> Result<ReconcileResult, LsError> {
        let mut item: DeployItem = match get_typed(self.store.as_ref(), &key.namespace, &key.name).await {
            Ok(di) => di,
            Err(e) if e.is_not_found() => return Ok(ReconcileResult::done()),
            Err(e) => return Err(store_error("GetDeployItem", e)),
        };
        let expected_uid = meta.uid.as_deref().unwrap_or_default();
        if item.uid() != expected_uid {
            return Err(LsError::new(
                "Reconcile",
                "UIDMismatch",
                format!("deploy item {} was recreated (uid {} != {})", key, item.uid(), expected_uid),
            ));
        }
        if !responsibility::type_matches(&item, &self.config.deployer_type) {
            trace!(item = %key, type_ = %item.spec.type_, "not our deployer type");
            return Ok(ReconcileResult::done());
        }

        let target = self.resolver.resolve(&item).await;
        // Requeue requests of every hook that ran, aborting or not.
        let mut hooked = ReconcileResult::done();
        let res = self.process(&mut item, &target, &mut hooked).await;
        let resolved = target.as_ref().ok().and_then(Option::as_ref);
        let end = self.hooks.execute(Some(&item), resolved, HookType::End).await;
        Ok(res?.merge(hooked).with_hook(end?))
    }

    async fn process(&self, item: &mut DeployItem, target: &Result<Option<ResolvedTarget>, LsError>, hooked: &mut ReconcileResult) -> Result<ReconcileResult, LsError> {
        let key = item.key();
        let resolved = target.as_ref().ok().and_then(Option::as_ref);

        let mut responsible = true;
        if !self.config.target_selectors.is_empty() {
            let resolved = target.as_ref().map_err(Clone::clone)?;
            responsible = responsibility::matches_all(&self.config.target_selectors, resolved.as_ref().map(|r| &r.target));
        }
        let during = self.hooks.execute(Some(&*item), resolved, HookType::DuringResponsibilityCheck).await?;
        *hooked = hooked.with_hook(during);
        if let Some(r) = during {
            responsible = !r.abort_reconcile;
        }
        if !responsible {
            debug!(item = %key, "not responsible for target");
            return Ok(ReconcileResult::done());
        }
        let after = self.hooks.execute(Some(&*item), resolved, HookType::AfterResponsibilityCheck).await?;
        *hooked = hooked.with_hook(after);
        if aborted(after) { return Ok(ReconcileResult::done().with_hook(after)); }

        if item.is_deleting() && !meta::has_finalizer(&item.metadata, FINALIZER) {
            trace!(item = %key, "deleting without our finalizer");
            return Ok(ReconcileResult::done());
        }

        let op = item.operation();
        let mut forced = matches!(op, Some(Operation::ForceReconcile | Operation::TestReconcile));
        let deletion_requested = item.is_deleting() && !item.status.phase.is_some_and(Phase::is_deleting);
        let mut has_work = item.status.job_id != item.status.job_id_finished || item.status.phase.is_none() || deletion_requested || forced;
        if !has_work {
            let should = self.hooks.execute(Some(&*item), resolved, HookType::ShouldReconcile).await?;
            *hooked = hooked.with_hook(should);
            if let Some(r) = should {
                if !r.abort_reconcile {
                    debug!(item = %key, "reconcile forced by hook");
                    forced = true;
                    has_work = true;
                }
            }
        }
        if !has_work {
            trace!(item = %key, phase = ?item.status.phase, "no work");
            if item.is_finished() { self.cache.add(&item.metadata); }
            return Ok(ReconcileResult::done());
        }

        let mut persisted = item.status.clone();

        if item.spec.update_on_change_only
            && !forced
            && !item.is_deleting()
            && item.has_new_job()
            && item.status.phase == Some(Phase::Succeeded)
            && item.generation() == item.status.observed_generation
        {
            info!(item = %key, job_id = %item.status.job_id, "spec unchanged; finishing job without reconcile");
            item.status.job_id_finished = item.status.job_id.clone();
            if !self.persist(item, &mut persisted).await? { return Ok(self.requeue()); }
            self.cache.add(&item.metadata);
            return Ok(ReconcileResult::done());
        }

        if item.has_new_job() || forced || item.status.phase.is_none() || deletion_requested {
            self.rearm(item);
            info!(item = %key, phase = ?item.status.phase, job_id = %item.status.job_id, "starting job");
            if !self.persist(item, &mut persisted).await? { return Ok(self.requeue()); }
        }

        if !item.is_deleting() && meta::add_finalizer(&mut item.metadata, FINALIZER) {
            debug!(item = %key, "adding finalizer");
            if !self.save_metadata(item).await? { return Ok(self.requeue()); }
        }

        let any = self.hooks.execute(Some(&*item), resolved, HookType::BeforeAnyReconcile).await?;
        *hooked = hooked.with_hook(any);
        if aborted(any) { return Ok(self.requeue().with_hook(any)); }

        let timeout = self.timeout_checker();
        let interruption = StoreInterruptionChecker::new(Arc::clone(&self.store), item);
        let target_err = target.as_ref().err().cloned();

        let result = if item.is_deleting() {
            let hook = self.hooks.execute(Some(&*item), resolved, HookType::BeforeDelete).await?;
            *hooked = hooked.with_hook(hook);
            if aborted(hook) { return Ok(self.requeue().with_hook(hook)); }
            item.status.phase = Some(Phase::Deleting);
            if !self.persist(item, &mut persisted).await? { return Ok(self.requeue()); }
            let res = if item.delete_without_uninstall() {
                info!(item = %key, "deleting without uninstall");
                Ok(())
            } else if let Some(e) = target_err {
                Err(e)
            } else {
                let ctx = DeployContext { item: &mut *item, target: resolved, timeout: timeout.as_ref(), interruption: &interruption };
                self.deployer.delete(ctx).await
            };
            if res.is_ok() {
                return self.finish_deletion(item).await;
            }
            res
        } else if op == Some(Operation::Abort) {
            let hook = self.hooks.execute(Some(&*item), resolved, HookType::BeforeAbort).await?;
            *hooked = hooked.with_hook(hook);
            if aborted(hook) { return Ok(self.requeue().with_hook(hook)); }
            let ctx = DeployContext { item: &mut *item, target: resolved, timeout: timeout.as_ref(), interruption: &NoInterruption };
            let res = self.deployer.abort(ctx).await;
            meta::remove_annotation(&mut item.metadata, annotations::OPERATION);
            if !self.save_metadata(item).await? { return Ok(self.requeue()); }
            item.status.phase = item.status.phase.map(Phase::failed_variant).or(Some(Phase::Failed));
            info!(item = %key, "job aborted");
            Err(res.err().unwrap_or_else(|| LsError::new("Abort", "Aborted", format!("deploy item {} was aborted", key))))
        } else if op == Some(Operation::ForceReconcile) {
            let hook = self.hooks.execute(Some(&*item), resolved, HookType::BeforeForceReconcile).await?;
            *hooked = hooked.with_hook(hook);
            if aborted(hook) { return Ok(self.requeue().with_hook(hook)); }
            meta::remove_annotation(&mut item.metadata, annotations::OPERATION);
            if !self.save_metadata(item).await? { return Ok(self.requeue()); }
            let Some(res) = self.run_reconcile(item, resolved, target_err, timeout.as_ref(), &interruption, &mut persisted, true).await? else {
                return Ok(self.requeue());
            };
            res
        } else {
            let hook = self.hooks.execute(Some(&*item), resolved, HookType::BeforeReconcile).await?;
            *hooked = hooked.with_hook(hook);
            if aborted(hook) { return Ok(self.requeue().with_hook(hook)); }
            let Some(res) = self.run_reconcile(item, resolved, target_err, timeout.as_ref(), &interruption, &mut persisted, false).await? else {
                return Ok(self.requeue());
            };
            if op == Some(Operation::TestReconcile) && meta::remove_annotation(&mut item.metadata, annotations::OPERATION) {
                if !self.save_metadata(item).await? { return Ok(self.requeue()); }
            }
            res
        };

        self.handle_reconcile_result(item, &mut persisted, result).await?;
        let final_phase = item.status.phase.is_some_and(Phase::is_final);
        Ok(if final_phase { ReconcileResult::done() } else { self.requeue() })
    }

    /// Mark progressing, persist, call the deployer. Success means `Succeeded`; `None` on a version conflict.
    #[allow(clippy::too_many_arguments)]
    async fn run_reconcile(
        &self,
        item: &mut DeployItem,
        target: Option<&ResolvedTarget>,
        target_err: Option<LsError>,
        timeout: &dyn TimeoutChecker,
        interruption: &dyn InterruptionChecker,
        persisted: &mut DeployItemStatus,
        force: bool,
    ) -> Result<Option<Result<(), LsError>>, LsError> {
        item.status.phase = Some(Phase::Progressing);
        if !self.persist(item, persisted).await? { return Ok(None); }
        if let Some(e) = target_err { return Ok(Some(Err(e))); }
        let ctx = DeployContext { item: &mut *item, target, timeout, interruption };
        let res = if force { self.deployer.force_reconcile(ctx).await } else { self.deployer.reconcile(ctx).await };
        if res.is_ok() { item.status.phase = Some(Phase::Succeeded); }
        Ok(Some(res))
    }

    fn rearm(&self, item: &mut DeployItem) {
        let now = self.clock.now();
        item.status.last_error = None;
        item.status.phase = Some(if item.is_deleting() { Phase::InitDelete } else { Phase::Init });
        item.status.transition_times = Some(TransitionTimes { trigger_time: Some(now), init_time: Some(now), wait_time: None, finished_time: None });
        item.status.observed_generation = item.generation();
        item.status.last_reconcile_time = Some(now);
        item.status.deployer = Some(DeployerInformation {
            identity: self.config.identity.clone(),
            name: self.config.name.clone(),
            version: self.config.version.clone(),
        });
    }

    /// Remove our finalizer once the deployer confirmed the uninstall.
    async fn finish_deletion(&self, item: &mut DeployItem) -> Result<ReconcileResult, LsError> {
        let key = item.key();
        if meta::remove_finalizer(&mut item.metadata, FINALIZER) {
            match update_typed(self.store.as_ref(), &*item).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) if e.is_conflict() => {
                    debug!(item = %key, "conflict removing finalizer");
                    return Ok(self.requeue());
                }
                Err(e) => return Err(store_error("RemoveFinalizer", e)),
            }
        }
        info!(item = %key, "deploy item deleted");
        self.cache.remove(&key);
        Ok(ReconcileResult::done())
    }

    /// Record the outcome of a deployer call on the status and persist it if anything changed.
    pub async fn handle_reconcile_result(&self, item: &mut DeployItem, persisted: &mut DeployItemStatus, result: Result<(), LsError>) -> Result<(), LsError> {
        let key = item.key();
        let now = self.clock.now();
        let phase = item.status.phase.unwrap_or(if item.is_deleting() { Phase::InitDelete } else { Phase::Init });
        match result {
            Ok(()) => item.status.last_error = None,
            Err(err) => {
                let err = err.updated(item.status.last_error.as_ref(), now);
                if err.is_info_only() {
                    info!(item = %key, op = %err.operation, reason = %err.reason, "{}", err.message);
                } else {
                    warn!(item = %key, op = %err.operation, reason = %err.reason, error = %err.message, "deployer returned an error");
                }
                self.events.record(item, EventType::Warning, &err.reason, &err.message).await;
                item.status.phase = Some(phase_for_last_error(phase, Some(&err), self.config.escalation_after, now));
                item.status.last_error = Some(err);
            }
        }

        let final_phase = item.status.phase.is_some_and(Phase::is_final);
        if final_phase {
            item.status.job_id_finished = item.status.job_id.clone();
            item.status.transition_times.get_or_insert_with(Default::default).finished_time = Some(now);
            info!(item = %key, phase = ?item.status.phase, job_id = %item.status.job_id, "job finished");
        }

        let err = match self.write_status(item, persisted).await {
            Ok(()) => {
                if final_phase { self.cache.add(&item.metadata); }
                return Ok(());
            }
            Err(e) => e,
        };
        // A removed item has no status left to write.
        if item.is_deleting() && self.item_gone(item).await {
            debug!(item = %key, error = %err, "deploy item removed before its status was written");
            return Ok(());
        }
        if err.is_conflict() {
            debug!(item = %key, "status update conflict; next event retries");
            return Ok(());
        }
        Err(store_error("UpdateStatus", err))
    }

    async fn item_gone(&self, item: &DeployItem) -> bool {
        matches!(self.store.get_metadata(&DeployItem::type_ref(), Some(item.namespace()), item.name()).await, Err(e) if e.is_not_found())
    }

    async fn write_status(&self, item: &mut DeployItem, persisted: &mut DeployItemStatus) -> Result<(), StoreError> {
        if item.status == *persisted { return Ok(()); }
        let updated = update_status_typed(self.store.as_ref(), &*item).await?;
        metrics::counter!("rudder_status_writes_total", 1u64);
        item.metadata = updated.metadata;
        *persisted = item.status.clone();
        Ok(())
    }

    /// Persist the status if it changed. `Ok(false)` on a version conflict.
    async fn persist(&self, item: &mut DeployItem, persisted: &mut DeployItemStatus) -> Result<bool, LsError> {
        match self.write_status(item, persisted).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!(item = %item.key(), "status update conflict; next event retries");
                Ok(false)
            }
            Err(e) => Err(store_error("UpdateStatus", e)),
        }
    }

    /// Write metadata changes, keeping the in-memory status. `Ok(false)` on a version conflict.
    async fn save_metadata(&self, item: &mut DeployItem) -> Result<bool, LsError> {
        match update_typed(self.store.as_ref(), &*item).await {
            Ok(updated) => {
                item.metadata = updated.metadata;
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(item = %item.key(), "metadata update conflict; next event retries");
                Ok(false)
            }
            Err(e) => Err(store_error("UpdateMetadata", e)),
        }
    }
}
