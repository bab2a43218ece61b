//! Feeds the controller: watch, periodic resync and lock cleanup push keys into a dedup queue;
//! a dispatcher hands them to at most `workers` concurrent reconciles.

use std::sync::Arc;
use std::time::Duration;

use kube::core::DynamicObject;
use rudder_core::{DeployItem, StoreObject, WatchEvent};
use rudder_store::WorkQueue;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{Controller, ItemKey};

const QUEUE_CAPACITY: usize = 10_000;
const WATCH_RETRY: Duration = Duration::from_secs(5);

pub struct Runner {
    controller: Arc<Controller>,
    queue: Arc<WorkQueue<ItemKey>>,
}

impl Runner {
    pub fn new(controller: Arc<Controller>) -> Self { Self { controller, queue: Arc::new(WorkQueue::with_capacity(QUEUE_CAPACITY)) } }

    pub fn queue(&self) -> &Arc<WorkQueue<ItemKey>> { &self.queue }

    /// Run until `cancel` fires, then wait for in-flight reconciles to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        let cfg = self.controller.config();
        info!(deployer_type = %cfg.deployer_type, identity = %cfg.identity, workers = cfg.workers, namespace = ?cfg.namespace, "runner starting");

        let mut tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(watch_items(Arc::clone(&self.controller), Arc::clone(&self.queue), cancel.clone())),
            tokio::spawn(resync(Arc::clone(&self.controller), Arc::clone(&self.queue), cancel.clone())),
        ];
        if cfg.locking {
            tasks.push(tokio::spawn(cleanup_locks(Arc::clone(&self.controller), cancel.clone())));
        }

        let workers = cfg.workers.max(1);
        let gate = Arc::new(Semaphore::new(workers));
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                k = self.queue.pop() => match k { Some(k) => k, None => break },
            };
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                p = Arc::clone(&gate).acquire_owned() => match p { Ok(p) => p, Err(_) => break },
            };
            metrics::gauge!("rudder_queue_depth", self.queue.len() as f64);
            let controller = Arc::clone(&self.controller);
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                let _permit = permit;
                let res = controller.reconcile(&key).await;
                queue.done(&key);
                let after = match res {
                    Ok(r) => r.requeue_after,
                    Err(_) => Some(controller.config().requeue_after),
                };
                if let Some(d) = after { queue.push_after(key, d); }
            });
        }

        info!("runner stopping; waiting for in-flight reconciles");
        self.queue.shutdown();
        let _ = gate.acquire_many(workers as u32).await;
        for t in tasks { t.abort(); }
        info!("runner stopped");
    }
}

fn wants(controller: &Controller, obj: &DynamicObject) -> bool {
    obj.data.get("spec").and_then(|s| s.get("type")).and_then(|t| t.as_str()) == Some(controller.config().deployer_type.as_str())
}

fn on_event(controller: &Controller, queue: &WorkQueue<ItemKey>, ev: WatchEvent) {
    match ev {
        WatchEvent::Applied(obj) => {
            if wants(controller, &obj) { queue.push(ItemKey::of(&obj.metadata)); }
        }
        WatchEvent::Deleted(obj) => controller.cache().remove(&ItemKey::of(&obj.metadata).to_string()),
        WatchEvent::Restarted(objs) => {
            for obj in objs.iter().filter(|o| wants(controller, o)) { queue.push(ItemKey::of(&obj.metadata)); }
        }
    }
}

async fn watch_items(controller: Arc<Controller>, queue: Arc<WorkQueue<ItemKey>>, cancel: CancellationToken) {
    loop {
        let (tx, mut rx) = mpsc::channel(256);
        let store = Arc::clone(controller.store());
        let namespace = controller.config().namespace.clone();
        let watch = tokio::spawn(async move { store.watch(&DeployItem::type_ref(), namespace.as_deref(), tx).await });
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    watch.abort();
                    return;
                }
                ev = rx.recv() => match ev {
                    Some(ev) => on_event(&controller, &queue, ev),
                    None => break,
                },
            }
        }
        match watch.await {
            Ok(Ok(())) => debug!("deploy item watch ended; restarting"),
            Ok(Err(e)) => warn!(error = %e, "deploy item watch failed; restarting"),
            Err(e) => warn!(error = %e, "deploy item watch task failed; restarting"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(WATCH_RETRY) => {}
        }
    }
}

async fn resync(controller: Arc<Controller>, queue: Arc<WorkQueue<ItemKey>>, cancel: CancellationToken) {
    let every = controller.config().resync_every;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        let namespace = controller.config().namespace.clone();
        match controller.store().list(&DeployItem::type_ref(), namespace.as_deref(), None).await {
            Ok(objs) => {
                let n = objs.len();
                on_event(&controller, &queue, WatchEvent::Restarted(objs));
                debug!(items = n, "resync");
            }
            Err(e) => warn!(error = %e, "resync list failed"),
        }
    }
}

async fn cleanup_locks(controller: Arc<Controller>, cancel: CancellationToken) {
    let every = controller.config().lock_cleanup_every;
    let locker = controller.locker();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }
        if let Err(e) = locker.cleanup_orphans(controller.config().namespace.as_deref()).await {
            warn!(error = %e, "lock cleanup failed");
        }
    }
}
