//! Accessors over `metadata` of raw objects.

use crate::{nested, OwnerRef, Uid};
use serde_json::Value;

pub fn name(v: &Value) -> &str {
    nested::str_field(v, &["metadata", "name"]).unwrap_or("")
}

pub fn namespace(v: &Value) -> Option<&str> {
    nested::str_field(v, &["metadata", "namespace"])
}

pub fn uid(v: &Value) -> Option<Uid> {
    nested::str_field(v, &["metadata", "uid"]).and_then(crate::parse_uid)
}

pub fn resource_version(v: &Value) -> &str {
    nested::str_field(v, &["metadata", "resourceVersion"]).unwrap_or("")
}

pub fn creation_timestamp(v: &Value) -> Option<&str> {
    nested::str_field(v, &["metadata", "creationTimestamp"])
}

pub fn labels(v: &Value) -> std::collections::BTreeMap<String, String> {
    string_map(v, &["metadata", "labels"])
}

pub fn annotations(v: &Value) -> std::collections::BTreeMap<String, String> {
    string_map(v, &["metadata", "annotations"])
}

fn string_map(v: &Value, path: &[&str]) -> std::collections::BTreeMap<String, String> {
    let mut out = std::collections::BTreeMap::new();
    if let Some(map) = nested::field(v, path).and_then(|x| x.as_object()) {
        for (k, val) in map {
            if let Some(s) = val.as_str() {
                out.insert(k.clone(), s.to_string());
            }
        }
    }
    out
}

/// The controlling owner reference, if any: the first entry whose
/// `controller` flag is true.
pub fn controller_owner(v: &Value) -> Option<OwnerRef> {
    let owners = nested::array_field(v, &["metadata", "ownerReferences"])?;
    owners
        .iter()
        .find(|o| o.get("controller").and_then(|c| c.as_bool()).unwrap_or(false))
        .map(|o| OwnerRef {
            kind: o.get("kind").and_then(|k| k.as_str()).unwrap_or("").to_string(),
            name: o.get("name").and_then(|n| n.as_str()).unwrap_or("").to_string(),
        })
}

/// Strip fields that are noise for diffing and display.
pub fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn controller_owner_prefers_controller_flag() {
        let v = json!({"metadata": {"ownerReferences": [
            {"kind": "ReplicaSet", "name": "web-abc", "controller": false},
            {"kind": "Deployment", "name": "web", "controller": true},
        ]}});
        let owner = controller_owner(&v).unwrap();
        assert_eq!(owner.kind, "Deployment");
        assert_eq!(owner.name, "web");
    }

    #[test]
    fn controller_owner_absent_when_no_controller() {
        let v = json!({"metadata": {"ownerReferences": [
            {"kind": "ReplicaSet", "name": "web-abc"},
        ]}});
        assert!(controller_owner(&v).is_none());
        assert!(controller_owner(&json!({"metadata": {}})).is_none());
    }

    #[test]
    fn strips_managed_fields_only() {
        let mut v = json!({"metadata": {"name": "a", "managedFields": [{"manager": "kubectl"}]}});
        strip_managed_fields(&mut v);
        assert_eq!(name(&v), "a");
        assert!(v["metadata"].get("managedFields").is_none());
    }
}
