//! Path helpers over raw objects. Custom resources arrive as arbitrary
//! nested mappings; these helpers keep the rest of the code free of
//! hand-rolled `.get(..).and_then(..)` chains.

use serde_json::Value;

/// Walk a field path, returning `None` when any segment is absent.
pub fn field<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = v;
    for seg in path {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

pub fn str_field<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    field(v, path).and_then(|x| x.as_str())
}

pub fn i64_field(v: &Value, path: &[&str]) -> Option<i64> {
    field(v, path).and_then(|x| x.as_i64())
}

pub fn bool_field(v: &Value, path: &[&str]) -> Option<bool> {
    field(v, path).and_then(|x| x.as_bool())
}

pub fn array_field<'a>(v: &'a Value, path: &[&str]) -> Option<&'a Vec<Value>> {
    field(v, path).and_then(|x| x.as_array())
}

/// Look up a dotted JSON path, e.g. `status.readyReplicas`.
pub fn dotted<'a>(v: &'a Value, path: &str) -> Option<&'a Value> {
    let segs: Vec<&str> = path.split('.').collect();
    field(v, &segs)
}

/// Find a condition entry by type in a conventional `status.conditions` list.
pub fn condition<'a>(v: &'a Value, cond_type: &str) -> Option<&'a Value> {
    array_field(v, &["status", "conditions"])?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(cond_type))
}

/// True when the named condition exists with `status: "True"`.
pub fn condition_true(v: &Value, cond_type: &str) -> bool {
    condition(v, cond_type)
        .and_then(|c| c.get("status"))
        .and_then(|s| s.as_str())
        == Some("True")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_paths_and_misses_safely() {
        let v = json!({"spec": {"replicas": 3, "selector": {"app": "web"}}});
        assert_eq!(i64_field(&v, &["spec", "replicas"]), Some(3));
        assert_eq!(str_field(&v, &["spec", "selector", "app"]), Some("web"));
        assert!(field(&v, &["spec", "template", "metadata"]).is_none());
        assert_eq!(dotted(&v, "spec.replicas"), Some(&json!(3)));
    }

    #[test]
    fn finds_conditions() {
        let v = json!({"status": {"conditions": [
            {"type": "Ready", "status": "True"},
            {"type": "MemoryPressure", "status": "False"},
        ]}});
        assert!(condition_true(&v, "Ready"));
        assert!(!condition_true(&v, "MemoryPressure"));
        assert!(!condition_true(&v, "DiskPressure"));
    }
}
