#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::{json, Value};

use vantage_cache::KindIndex;
use vantage_core::{EdgeRelation, HealthState, ViewMode};
use vantage_topology::build_topology;

fn index_of(objs: Vec<Value>) -> Arc<KindIndex> {
    let mut index = KindIndex::default();
    for obj in objs {
        let ns = obj["metadata"]["namespace"].as_str().map(|s| s.to_string());
        let name = obj["metadata"]["name"].as_str().unwrap().to_string();
        index.objects.insert((ns, name), Arc::new(obj));
    }
    // ArcSwap round-trip mirrors how the cache hands indices out.
    let swap = ArcSwap::from_pointee(index);
    swap.load_full()
}

fn deployment(ns: &str, name: &str, ready: i64, desired: i64) -> Value {
    json!({
        "metadata": {"name": name, "namespace": ns, "uid": "00000000-0000-0000-0000-000000000001"},
        "spec": {"replicas": desired},
        "status": {"readyReplicas": ready, "updatedReplicas": desired},
    })
}

fn replica_set(ns: &str, name: &str, owner: &str) -> Value {
    json!({
        "metadata": {"name": name, "namespace": ns,
            "ownerReferences": [{"kind": "Deployment", "name": owner, "controller": true}]},
        "spec": {"replicas": 1},
        "status": {"readyReplicas": 1, "updatedReplicas": 1},
    })
}

fn pod(ns: &str, name: &str, owner: Option<&str>, labels: Value) -> Value {
    let mut metadata = json!({"name": name, "namespace": ns, "labels": labels});
    if let Some(owner) = owner {
        metadata["ownerReferences"] =
            json!([{"kind": "ReplicaSet", "name": owner, "controller": true}]);
    }
    json!({
        "metadata": metadata,
        "spec": {"volumes": [{"configMap": {"name": "web-config"}}]},
        "status": {"phase": "Running", "containerStatuses": [{"ready": true}]},
    })
}

fn service(ns: &str, name: &str, selector: Value) -> Value {
    json!({
        "metadata": {"name": name, "namespace": ns},
        "spec": {"selector": selector},
    })
}

fn ingress(ns: &str, name: &str, backend: &str) -> Value {
    json!({
        "metadata": {"name": name, "namespace": ns},
        "spec": {"rules": [{"http": {"paths": [
            {"backend": {"service": {"name": backend, "port": {"number": 80}}}},
        ]}}]},
    })
}

fn sample_state() -> Vec<(String, Arc<KindIndex>)> {
    vec![
        (
            "ConfigMap".to_string(),
            index_of(vec![json!({"metadata": {"name": "web-config", "namespace": "app"}})]),
        ),
        (
            "Deployment".to_string(),
            index_of(vec![deployment("app", "web", 3, 3)]),
        ),
        (
            "HorizontalPodAutoscaler".to_string(),
            index_of(vec![json!({
                "metadata": {"name": "web-hpa", "namespace": "app"},
                "spec": {"scaleTargetRef": {"kind": "Deployment", "name": "web"}},
            })]),
        ),
        (
            "Ingress".to_string(),
            index_of(vec![ingress("app", "web-ing", "web-svc")]),
        ),
        (
            "Node".to_string(),
            index_of(vec![json!({
                "metadata": {"name": "node-1"},
                "status": {"conditions": [{"type": "Ready", "status": "True"}]},
            })]),
        ),
        (
            "Pod".to_string(),
            index_of(vec![
                pod("app", "web-abc-1", Some("web-abc"), json!({"app": "web"})),
                pod("other", "stray", None, json!({"app": "web"})),
            ]),
        ),
        (
            "ReplicaSet".to_string(),
            index_of(vec![replica_set("app", "web-abc", "web")]),
        ),
        (
            "Service".to_string(),
            index_of(vec![service("app", "web-svc", json!({"app": "web"}))]),
        ),
    ]
}

fn has_edge(topo: &vantage_core::Topology, source: &str, target: &str, rel: EdgeRelation) -> bool {
    topo.edges
        .iter()
        .any(|e| e.source == source && e.target == target && e.relation == rel)
}

#[test]
fn resources_view_follows_ownership_chain() {
    let topo = build_topology(&sample_state(), ViewMode::Resources, None, 1);
    assert!(has_edge(
        &topo,
        "Deployment/app/web",
        "ReplicaSet/app/web-abc",
        EdgeRelation::Owns
    ));
    assert!(has_edge(
        &topo,
        "ReplicaSet/app/web-abc",
        "Pod/app/web-abc-1",
        EdgeRelation::Owns
    ));
    assert!(has_edge(
        &topo,
        "Pod/app/web-abc-1",
        "ConfigMap/app/web-config",
        EdgeRelation::Mounts
    ));
    // Traffic-only relations stay out of the resources view.
    assert!(!topo
        .edges
        .iter()
        .any(|e| matches!(e.relation, EdgeRelation::Routes | EdgeRelation::Selects)));
}

#[test]
fn traffic_view_routes_selects_and_scales() {
    let topo = build_topology(&sample_state(), ViewMode::Traffic, None, 1);
    assert!(has_edge(
        &topo,
        "Ingress/app/web-ing",
        "Service/app/web-svc",
        EdgeRelation::Routes
    ));
    assert!(has_edge(
        &topo,
        "Service/app/web-svc",
        "Pod/app/web-abc-1",
        EdgeRelation::Selects
    ));
    assert!(has_edge(
        &topo,
        "HorizontalPodAutoscaler/app/web-hpa",
        "Deployment/app/web",
        EdgeRelation::Scales
    ));
    assert!(has_edge(
        &topo,
        "ReplicaSet/app/web-abc",
        "Pod/app/web-abc-1",
        EdgeRelation::Owns
    ));
    // Selector matching never crosses namespaces.
    assert!(!has_edge(
        &topo,
        "Service/app/web-svc",
        "Pod/other/stray",
        EdgeRelation::Selects
    ));
}

#[test]
fn every_edge_endpoint_is_a_node() {
    for view in [ViewMode::Resources, ViewMode::Traffic] {
        let topo = build_topology(&sample_state(), view, None, 1);
        let ids: std::collections::HashSet<&str> =
            topo.nodes.iter().map(|n| n.id.as_str()).collect();
        for edge in &topo.edges {
            assert!(ids.contains(edge.source.as_str()), "dangling {}", edge.source);
            assert!(ids.contains(edge.target.as_str()), "dangling {}", edge.target);
        }
    }
}

#[test]
fn builds_are_deterministic() {
    let state = sample_state();
    let a = build_topology(&state, ViewMode::Traffic, None, 7);
    let b = build_topology(&state, ViewMode::Traffic, None, 7);
    assert_eq!(a.nodes, b.nodes);
    assert_eq!(a.edges, b.edges);
    assert!(a.nodes.windows(2).all(|w| w[0].id < w[1].id));
}

#[test]
fn namespace_filter_drops_foreign_and_unreferenced_cluster_nodes() {
    let topo = build_topology(&sample_state(), ViewMode::Resources, Some("app"), 1);
    assert!(topo.nodes.iter().all(|n| n.namespace.as_deref() == Some("app")));
    assert!(!topo.nodes.iter().any(|n| n.id == "Pod/other/stray"));
    // node-1 is cluster-scoped and nothing in "app" references it.
    assert!(!topo.nodes.iter().any(|n| n.kind == "Node"));
}

#[test]
fn degraded_deployment_surfaces_in_node_health() {
    let mut state = sample_state();
    for entry in &mut state {
        if entry.0 == "Deployment" {
            entry.1 = index_of(vec![deployment("app", "web", 1, 3)]);
        }
    }
    let topo = build_topology(&state, ViewMode::Resources, None, 2);
    let node = topo
        .nodes
        .iter()
        .find(|n| n.id == "Deployment/app/web")
        .expect("deployment node present");
    assert_eq!(node.health, HealthState::Degraded);
    assert_eq!(node.status.as_deref(), Some("1/3"));
}

#[test]
fn deleted_object_leaves_the_graph() {
    let mut state = sample_state();
    for entry in &mut state {
        if entry.0 == "Pod" {
            entry.1 = index_of(vec![pod("other", "stray", None, json!({"app": "web"}))]);
        }
    }
    let topo = build_topology(&state, ViewMode::Resources, None, 3);
    assert!(!topo.nodes.iter().any(|n| n.id == "Pod/app/web-abc-1"));
    assert!(!topo
        .edges
        .iter()
        .any(|e| e.source == "Pod/app/web-abc-1" || e.target == "Pod/app/web-abc-1"));
}
