//! Remember what was last applied so unchanged stamps are not re-patched.

use std::sync::{Mutex, PoisonError};

use rustc_hash::FxHashMap;
use serde_json::Value;

type Key = (String, String, String, String);

fn key_of(obj: &Value) -> Option<Key> {
    let s = |p: &str| obj.pointer(p).and_then(Value::as_str).unwrap_or_default().to_string();
    let name = s("/metadata/name");
    if name.is_empty() {
        return None;
    }
    Some((s("/apiVersion"), s("/kind"), s("/metadata/namespace"), name))
}

fn resource_version(obj: &Value) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

#[derive(Debug, Clone)]
struct Entry {
    submitted: Value,
    persisted: Value,
}

/// Last submitted and returned object per stamped name.
#[derive(Default)]
pub struct StampCache {
    entries: Mutex<FxHashMap<Key, Entry>>,
}

impl StampCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, submitted: &Value, persisted: &Value) {
        if let Some(k) = key_of(submitted) {
            let entry = Entry { submitted: submitted.clone(), persisted: persisted.clone() };
            self.entries.lock().unwrap_or_else(PoisonError::into_inner).insert(k, entry);
        }
    }

    /// The persisted object when `submitted` repeats the last submission and
    /// `live` has not moved since it was returned.
    pub fn unchanged(&self, submitted: &Value, live: &Value) -> Option<Value> {
        let k = key_of(submitted)?;
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(&k)?;
        let same_live = resource_version(live).is_some() && resource_version(live) == resource_version(&entry.persisted);
        (entry.submitted == *submitted && same_live).then(|| live.clone())
    }

    pub fn forget(&self, api_version: &str, kind: &str, namespace: &str, name: &str) {
        let k = (api_version.to_string(), kind.to_string(), namespace.to_string(), name.to_string());
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).remove(&k);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(data: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "app-config", "namespace": "dev"}, "data": {"k": data}})
    }

    fn persisted(data: &str, rv: &str) -> Value {
        let mut v = cm(data);
        v["metadata"]["resourceVersion"] = json!(rv);
        v
    }

    #[test]
    fn repeat_submission_against_untouched_object_is_skipped() {
        let cache = StampCache::new();
        cache.set(&cm("a"), &persisted("a", "7"));
        assert_eq!(cache.unchanged(&cm("a"), &persisted("a", "7")), Some(persisted("a", "7")));
    }

    #[test]
    fn new_content_or_drifted_live_object_is_applied() {
        let cache = StampCache::new();
        cache.set(&cm("a"), &persisted("a", "7"));
        assert!(cache.unchanged(&cm("b"), &persisted("a", "7")).is_none());
        assert!(cache.unchanged(&cm("a"), &persisted("a", "8")).is_none());

        cache.forget("v1", "ConfigMap", "dev", "app-config");
        assert!(cache.is_empty());
        assert!(cache.unchanged(&cm("a"), &persisted("a", "7")).is_none());
    }

    #[test]
    fn generated_names_are_not_cached() {
        let cache = StampCache::new();
        let obj = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"generateName": "run-", "namespace": "dev"}});
        cache.set(&obj, &persisted("a", "1"));
        assert!(cache.is_empty());
    }
}
