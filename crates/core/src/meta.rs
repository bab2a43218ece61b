//! Small helpers over `ObjectMeta` shared by typed and dynamic objects.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// `namespace/name`, or just `name` for cluster-scoped objects.
pub fn key(meta: &ObjectMeta) -> String {
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers.as_ref().is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Returns true if the finalizer was added.
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) { return false; }
    meta.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
    true
}

/// Returns true if the finalizer was present.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(list) = meta.finalizers.as_mut() else { return false };
    let before = list.len();
    list.retain(|f| f != finalizer);
    before != list.len()
}

pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations.as_ref().and_then(|a| a.get(key)).map(|s| s.as_str())
}

pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.annotations.get_or_insert_with(Default::default).insert(key.to_string(), value.to_string());
}

pub fn remove_annotation(meta: &mut ObjectMeta, key: &str) -> bool {
    meta.annotations.as_mut().and_then(|a| a.remove(key)).is_some()
}

pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels.as_ref().and_then(|l| l.get(key)).map(|s| s.as_str())
}

pub fn set_label(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.labels.get_or_insert_with(Default::default).insert(key.to_string(), value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizers_add_once_and_remove() {
        let mut m = ObjectMeta::default();
        assert!(add_finalizer(&mut m, "a"));
        assert!(!add_finalizer(&mut m, "a"));
        assert!(has_finalizer(&m, "a"));
        assert!(remove_finalizer(&mut m, "a"));
        assert!(!remove_finalizer(&mut m, "a"));
        assert!(!has_finalizer(&m, "a"));
    }

    #[test]
    fn key_omits_empty_namespace() {
        let mut m = ObjectMeta { name: Some("x".into()), ..Default::default() };
        assert_eq!(key(&m), "x");
        m.namespace = Some("ns".into());
        assert_eq!(key(&m), "ns/x");
    }
}
