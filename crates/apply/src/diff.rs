//! Structural comparison and merging of manifests against live objects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::config::UpdateStrategy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Drop server-populated fields so only intent is compared.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "deletionTimestamp", "selfLink"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv { s.updates += 1; }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Deep-merge `patch` into `base`. Without `overwrite` only missing keys are filled in.
/// Arrays and scalars are replaced as a whole.
pub fn merge(base: &mut Json, patch: &Json, overwrite: bool) {
    match (base, patch) {
        (Json::Object(bo), Json::Object(po)) => merge_maps(bo, po, overwrite),
        (b, p) => {
            if overwrite || b.is_null() { *b = p.clone(); }
        }
    }
}

fn merge_maps(base: &mut Map<String, Json>, patch: &Map<String, Json>, overwrite: bool) {
    for (k, pv) in patch {
        match base.get_mut(k) {
            Some(bv) => merge(bv, pv, overwrite),
            None => {
                base.insert(k.clone(), pv.clone());
            }
        }
    }
}

/// Desired state of an existing object under `strategy`.
pub fn desired_state(live: &Json, manifest: &Json, strategy: UpdateStrategy) -> Json {
    match strategy {
        UpdateStrategy::Update => manifest.clone(),
        UpdateStrategy::Merge | UpdateStrategy::MergeOverwrite => {
            let mut out = strip_noisy(live.clone());
            merge(&mut out, manifest, strategy == UpdateStrategy::MergeOverwrite);
            out
        }
    }
}
