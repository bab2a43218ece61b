use std::sync::Mutex;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rudder_core::meta;
use rustc_hash::FxHashMap;

/// Process-local record of items last seen finished, keyed by `namespace/name` at a resource version.
///
/// A hit lets a reconcile stop after the metadata read. Misses and poisoned locks fall through to
/// the full path, so the cache may be stale or empty without affecting correctness.
#[derive(Debug, Default)]
pub struct FinishedObjectCache {
    entries: Mutex<FxHashMap<String, String>>,
}

impl FinishedObjectCache {
    pub fn add(&self, meta: &ObjectMeta) {
        let Some(rv) = meta.resource_version.clone() else { return };
        if let Ok(mut e) = self.entries.lock() { e.insert(meta::key(meta), rv); }
    }

    /// True only when the recorded version equals the one in `meta`.
    pub fn is_finished(&self, meta: &ObjectMeta) -> bool {
        let Some(rv) = meta.resource_version.as_deref() else { return false };
        self.entries.lock().map(|e| e.get(&meta::key(meta)).is_some_and(|v| v == rv)).unwrap_or(false)
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut e) = self.entries.lock() { e.remove(key); }
    }

    pub fn len(&self) -> usize { self.entries.lock().map(|e| e.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(rv: &str) -> ObjectMeta {
        ObjectMeta { name: Some("a".into()), namespace: Some("ns".into()), resource_version: Some(rv.into()), ..Default::default() }
    }

    #[test]
    fn hit_requires_same_version() {
        let cache = FinishedObjectCache::default();
        assert!(!cache.is_finished(&meta("1")));
        cache.add(&meta("1"));
        assert!(cache.is_finished(&meta("1")));
        assert!(!cache.is_finished(&meta("2")), "any later write invalidates");
        cache.remove("ns/a");
        assert!(cache.is_empty());
    }
}
