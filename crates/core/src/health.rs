//! Per-kind health rules. Health is a pure function of the object itself;
//! the history engine and the topology builder share this table.

use crate::nested;
use crate::HealthState;
use serde_json::Value;

const BAD_WAITING_REASONS: &[&str] = &["CrashLoopBackOff", "ImagePullBackOff", "ErrImagePull"];

/// Kinds that carry a ready/desired replica pair.
pub fn replica_bearing(kind: &str) -> bool {
    matches!(
        kind,
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet"
    )
}

/// `(ready, desired)` for replica-bearing kinds.
pub fn ready_desired(kind: &str, v: &Value) -> Option<(i64, i64)> {
    match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let desired = nested::i64_field(v, &["spec", "replicas"]).unwrap_or(1);
            let ready = nested::i64_field(v, &["status", "readyReplicas"]).unwrap_or(0);
            Some((ready, desired))
        }
        "DaemonSet" => {
            let desired =
                nested::i64_field(v, &["status", "desiredNumberScheduled"]).unwrap_or(0);
            let ready = nested::i64_field(v, &["status", "numberReady"]).unwrap_or(0);
            Some((ready, desired))
        }
        _ => None,
    }
}

fn updated_count(kind: &str, v: &Value) -> Option<i64> {
    match kind {
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            nested::i64_field(v, &["status", "updatedReplicas"])
        }
        "DaemonSet" => nested::i64_field(v, &["status", "updatedNumberScheduled"]),
        _ => None,
    }
}

pub fn evaluate(kind: &str, v: &Value) -> HealthState {
    match kind {
        "Pod" => pod_health(v),
        k if replica_bearing(k) => workload_health(k, v),
        "Node" => node_health(v),
        _ => {
            if nested::condition_true(v, "Ready") || nested::condition_true(v, "Available") {
                HealthState::Healthy
            } else {
                HealthState::Unknown
            }
        }
    }
}

fn pod_health(v: &Value) -> HealthState {
    // Backoff loops trump the phase: a Running pod with a crash-looping
    // container is broken, not degraded.
    if let Some(statuses) = nested::array_field(v, &["status", "containerStatuses"]) {
        for cs in statuses {
            if let Some(reason) =
                nested::str_field(cs, &["state", "waiting", "reason"])
            {
                if BAD_WAITING_REASONS.contains(&reason) {
                    return HealthState::Unhealthy;
                }
            }
        }
    }
    match nested::str_field(v, &["status", "phase"]) {
        Some("Running") => {
            let all_ready = nested::array_field(v, &["status", "containerStatuses"])
                .map(|cs| {
                    cs.iter()
                        .all(|c| c.get("ready").and_then(|r| r.as_bool()).unwrap_or(false))
                })
                .unwrap_or(false);
            if all_ready {
                HealthState::Healthy
            } else {
                HealthState::Degraded
            }
        }
        Some("Succeeded") => HealthState::Healthy,
        Some("Pending") => HealthState::Degraded,
        Some("Failed") | Some("Unknown") => HealthState::Unhealthy,
        _ => HealthState::Unknown,
    }
}

fn workload_health(kind: &str, v: &Value) -> HealthState {
    let (ready, desired) = match ready_desired(kind, v) {
        Some(rd) => rd,
        None => return HealthState::Unknown,
    };
    if ready == desired {
        if let Some(updated) = updated_count(kind, v) {
            if updated < desired {
                return HealthState::Degraded;
            }
        }
        return HealthState::Healthy;
    }
    if ready == 0 && desired > 0 {
        return HealthState::Unhealthy;
    }
    HealthState::Degraded
}

fn node_health(v: &Value) -> HealthState {
    if !nested::condition_true(v, "Ready") {
        return HealthState::Unhealthy;
    }
    for pressure in [
        "DiskPressure",
        "MemoryPressure",
        "PIDPressure",
        "NetworkUnavailable",
    ] {
        if nested::condition_true(v, pressure) {
            return HealthState::Degraded;
        }
    }
    let cordoned = nested::bool_field(v, &["spec", "unschedulable"]).unwrap_or(false);
    if cordoned {
        return HealthState::Degraded;
    }
    HealthState::Healthy
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pod_running_ready_is_healthy() {
        let v = json!({"status": {"phase": "Running", "containerStatuses": [
            {"ready": true}, {"ready": true},
        ]}});
        assert_eq!(evaluate("Pod", &v), HealthState::Healthy);
    }

    #[test]
    fn pod_crashloop_is_unhealthy_even_while_running() {
        let v = json!({"status": {"phase": "Running", "containerStatuses": [
            {"ready": false, "state": {"waiting": {"reason": "CrashLoopBackOff"}}},
        ]}});
        assert_eq!(evaluate("Pod", &v), HealthState::Unhealthy);
    }

    #[test]
    fn pod_pending_is_degraded() {
        let v = json!({"status": {"phase": "Pending"}});
        assert_eq!(evaluate("Pod", &v), HealthState::Degraded);
    }

    #[test]
    fn deployment_transitions() {
        let full = json!({"spec": {"replicas": 3},
            "status": {"readyReplicas": 3, "updatedReplicas": 3}});
        assert_eq!(evaluate("Deployment", &full), HealthState::Healthy);

        let partial = json!({"spec": {"replicas": 3},
            "status": {"readyReplicas": 1, "updatedReplicas": 3}});
        assert_eq!(evaluate("Deployment", &partial), HealthState::Degraded);

        let down = json!({"spec": {"replicas": 3}, "status": {}});
        assert_eq!(evaluate("Deployment", &down), HealthState::Unhealthy);

        let rolling = json!({"spec": {"replicas": 3},
            "status": {"readyReplicas": 3, "updatedReplicas": 1}});
        assert_eq!(evaluate("Deployment", &rolling), HealthState::Degraded);
    }

    #[test]
    fn scaled_to_zero_is_healthy() {
        let v = json!({"spec": {"replicas": 0}, "status": {}});
        assert_eq!(evaluate("Deployment", &v), HealthState::Healthy);
    }

    #[test]
    fn node_states() {
        let ok = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        assert_eq!(evaluate("Node", &ok), HealthState::Healthy);

        let pressure = json!({"status": {"conditions": [
            {"type": "Ready", "status": "True"},
            {"type": "MemoryPressure", "status": "True"},
        ]}});
        assert_eq!(evaluate("Node", &pressure), HealthState::Degraded);

        let cordoned = json!({"spec": {"unschedulable": true},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        assert_eq!(evaluate("Node", &cordoned), HealthState::Degraded);

        let notready = json!({"status": {"conditions": [{"type": "Ready", "status": "False"}]}});
        assert_eq!(evaluate("Node", &notready), HealthState::Unhealthy);
    }

    #[test]
    fn unknown_kind_needs_positive_condition() {
        let v = json!({"status": {"conditions": [{"type": "Available", "status": "True"}]}});
        assert_eq!(evaluate("FooBar", &v), HealthState::Healthy);
        assert_eq!(evaluate("FooBar", &json!({})), HealthState::Unknown);
    }
}
