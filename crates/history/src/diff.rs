//! Field-level diffing over the meaningful subtrees of an object: spec,
//! status, labels and annotations. Bookkeeping fields (`managedFields`,
//! `resourceVersion`, generation counters) never appear in a diff.

use serde_json::Value;
use vantage_core::FieldDiff;

const MAX_DIFF_ENTRIES: usize = 64;

const DIFF_ROOTS: &[&[&str]] = &[
    &["spec"],
    &["status"],
    &["metadata", "labels"],
    &["metadata", "annotations"],
];

/// Status fields that churn without carrying meaning for an operator.
const NOISE_PATHS: &[&str] = &["status.observedGeneration"];

/// Compare two versions of an object across the meaningful subtrees.
/// Arrays and scalars diff as whole values; maps recurse.
pub fn diff_objects(before: &Value, after: &Value) -> Vec<FieldDiff> {
    let mut out = Vec::new();
    for root in DIFF_ROOTS {
        let a = vantage_core::nested::field(before, root);
        let b = vantage_core::nested::field(after, root);
        let path = root.join(".");
        diff_value(&path, a, b, &mut out);
        if out.len() >= MAX_DIFF_ENTRIES {
            out.truncate(MAX_DIFF_ENTRIES);
            break;
        }
    }
    out.retain(|d| !NOISE_PATHS.contains(&d.path.as_str()));
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

fn diff_value(path: &str, before: Option<&Value>, after: Option<&Value>, out: &mut Vec<FieldDiff>) {
    if out.len() >= MAX_DIFF_ENTRIES {
        return;
    }
    match (before, after) {
        (None, None) => {}
        (Some(a), Some(b)) if a == b => {}
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = format!("{}.{}", path, key);
                diff_value(&child, a.get(key.as_str()), b.get(key.as_str()), out);
            }
        }
        (a, b) => out.push(FieldDiff {
            path: path.to_string(),
            before: a.cloned().unwrap_or(Value::Null),
            after: b.cloned().unwrap_or(Value::Null),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_change_yields_single_entry() {
        let before = json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 3}});
        let after = json!({"spec": {"replicas": 3}, "status": {"readyReplicas": 1}});
        let diff = diff_objects(&before, &after);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "status.readyReplicas");
        assert_eq!(diff[0].before, json!(3));
        assert_eq!(diff[0].after, json!(1));
    }

    #[test]
    fn added_and_removed_fields_diff_against_null() {
        let before = json!({"metadata": {"labels": {"app": "web"}}});
        let after = json!({"metadata": {"labels": {"app": "web", "tier": "front"}}});
        let diff = diff_objects(&before, &after);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "metadata.labels.tier");
        assert_eq!(diff[0].before, Value::Null);
        assert_eq!(diff[0].after, json!("front"));
    }

    #[test]
    fn resource_version_churn_is_invisible() {
        let before = json!({"metadata": {"resourceVersion": "1", "labels": {"a": "1"}}});
        let after = json!({"metadata": {"resourceVersion": "2", "labels": {"a": "1"}}});
        assert!(diff_objects(&before, &after).is_empty());
    }

    #[test]
    fn arrays_replace_wholesale() {
        let before = json!({"spec": {"containers": [{"image": "a:1"}]}});
        let after = json!({"spec": {"containers": [{"image": "a:2"}]}});
        let diff = diff_objects(&before, &after);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "spec.containers");
    }

    #[test]
    fn nested_maps_recurse_to_leaves() {
        let before = json!({"spec": {"template": {"spec": {"nodeSelector": {"zone": "a"}}}}});
        let after = json!({"spec": {"template": {"spec": {"nodeSelector": {"zone": "b"}}}}});
        let diff = diff_objects(&before, &after);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "spec.template.spec.nodeSelector.zone");
    }
}
