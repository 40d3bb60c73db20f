//! Content hashing for inventory items.
//!
//! The hash is computed over a canonical form of the object body with
//! volatile metadata removed, so it is stable across re-applies of
//! unchanged content and sensitive to any change in `spec`, labels or
//! annotations.
use sha2::{Digest, Sha256};
use std::fmt;

/// Top-level keys stripped before hashing because the cluster (not the
/// template) owns them.
const VOLATILE_STATUS_KEYS: &[&str] = &["status"];
const VOLATILE_METADATA_KEYS: &[&str] = &["resourceVersion", "uid", "creationTimestamp", "managedFields"];

/// A `sha256:<hex>` content hash, matching the `ContentHash` convention used
/// elsewhere in the retrieved pack for content-addressed storage.
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash the canonical form of an object body, stripping volatile fields first.
    pub fn of_object(body: &serde_json::Value) -> Self {
        let canonical = canonicalize(body);
        let bytes = serde_json::to_vec(&canonical).expect("canonical value is always serializable");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.0)
    }
}

/// Strip volatile fields and recursively sort object keys so that two
/// semantically-identical documents serialize to identical bytes regardless
/// of field order.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = std::collections::BTreeMap::new();
            for (k, v) in map {
                if VOLATILE_STATUS_KEYS.contains(&k.as_str()) {
                    continue;
                }
                if k == "metadata" {
                    sorted.insert(k.clone(), canonicalize_metadata(v));
                    continue;
                }
                sorted.insert(k.clone(), canonicalize(v));
            }
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

fn canonicalize_metadata(metadata: &serde_json::Value) -> serde_json::Value {
    match metadata {
        serde_json::Value::Object(map) => {
            let mut sorted = std::collections::BTreeMap::new();
            for (k, v) in map {
                if VOLATILE_METADATA_KEYS.contains(&k.as_str()) {
                    continue;
                }
                sorted.insert(k.clone(), canonicalize(v));
            }
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        other => canonicalize(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stable_under_volatile_field_changes() {
        let a = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "cfg", "resourceVersion": "1", "uid": "a"},
            "data": {"k": "v"},
        });
        let b = json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "cfg", "resourceVersion": "999", "uid": "b"},
            "data": {"k": "v"},
        });
        assert_eq!(ContentHash::of_object(&a), ContentHash::of_object(&b));
    }

    #[test]
    fn stable_under_status_changes() {
        let a = json!({"metadata": {"name": "x"}, "spec": {"replicas": 1}, "status": {"ready": false}});
        let b = json!({"metadata": {"name": "x"}, "spec": {"replicas": 1}, "status": {"ready": true}});
        assert_eq!(ContentHash::of_object(&a), ContentHash::of_object(&b));
    }

    #[test]
    fn sensitive_to_spec_changes() {
        let a = json!({"metadata": {"name": "x"}, "spec": {"replicas": 1}});
        let b = json!({"metadata": {"name": "x"}, "spec": {"replicas": 2}});
        assert_ne!(ContentHash::of_object(&a), ContentHash::of_object(&b));
    }

    #[test]
    fn sensitive_to_label_changes() {
        let a = json!({"metadata": {"name": "x", "labels": {"a": "1"}}});
        let b = json!({"metadata": {"name": "x", "labels": {"a": "2"}}});
        assert_ne!(ContentHash::of_object(&a), ContentHash::of_object(&b));
    }

    #[test]
    fn insensitive_to_key_order() {
        let a = json!({"metadata": {"name": "x"}, "spec": {"a": 1, "b": 2}});
        let b = json!({"spec": {"b": 2, "a": 1}, "metadata": {"name": "x"}});
        assert_eq!(ContentHash::of_object(&a), ContentHash::of_object(&b));
    }
}
