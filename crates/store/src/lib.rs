//! Rudder store: in-memory cluster store and the reconcile work queue.

#![forbid(unsafe_code)]

mod mem;

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::debug;

pub use mem::{MemStore, Verb};

/// Deduplicating FIFO of keys awaiting reconciliation.
///
/// A key is queued at most once. A key pushed while a worker holds it is marked dirty and
/// re-queued when that worker calls [`WorkQueue::done`], so one key is never processed twice
/// concurrently. On overflow the oldest queued key is dropped.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    cap: usize,
}

struct QueueState<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    dropped: u64,
    shutdown: bool,
}

impl<K: Eq + Hash + Clone + Send + 'static> WorkQueue<K> {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                queued: FxHashSet::default(),
                processing: FxHashSet::default(),
                dirty: FxHashSet::default(),
                dropped: 0,
                shutdown: false,
            }),
            notify: Notify::new(),
            cap: cap.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn len(&self) -> usize { self.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn dropped(&self) -> u64 { self.lock().dropped }

    pub fn push(&self, key: K) {
        let mut st = self.lock();
        if st.shutdown { return; }
        if st.processing.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        if st.queued.contains(&key) { return; }
        if st.order.len() >= self.cap {
            if let Some(old) = st.order.pop_front() {
                st.queued.remove(&old);
                st.dropped += 1;
                metrics::counter!("rudder_queue_dropped_total", 1u64);
            }
        }
        st.queued.insert(key.clone());
        st.order.push_back(key);
        metrics::gauge!("rudder_queue_depth", st.order.len() as f64);
        drop(st);
        self.notify.notify_one();
    }

    /// Push once `delay` has elapsed.
    pub fn push_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() { return self.push(key); }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.push(key);
        });
    }

    /// Next key to process; `None` once the queue is shut down.
    pub async fn pop(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if st.shutdown { return None; }
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key taken by [`WorkQueue::pop`].
    pub fn done(&self, key: &K) {
        let requeue = {
            let mut st = self.lock();
            st.processing.remove(key);
            st.dirty.remove(key)
        };
        if requeue {
            debug!("key changed while processing; requeued");
            self.push(key.clone());
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}
