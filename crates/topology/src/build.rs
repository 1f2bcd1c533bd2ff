//! Pure graph derivation over a mirror snapshot. Nodes are arena-indexed
//! while building so edge emission is index math; the published form uses
//! stable string ids.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use vantage_cache::KindIndex;
use vantage_core::{
    health, meta, nested, EdgeRelation, HealthState, Topology, TopologyEdge, TopologyNode, ViewMode,
};

/// Kinds mirrored as a stream rather than as graph state.
const NON_GRAPH_KINDS: &[&str] = &["Event"];

/// Kinds whose controller-owner edge is emitted in both view modes.
const POD_OWNER_KINDS: &[&str] = &["ReplicaSet", "StatefulSet", "DaemonSet", "Job"];

struct Arena {
    nodes: Vec<TopologyNode>,
    by_id: FxHashMap<String, usize>,
    namespaced: Vec<bool>,
}

impl Arena {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_id: FxHashMap::default(),
            namespaced: Vec::new(),
        }
    }

    fn insert(&mut self, node: TopologyNode) -> usize {
        let namespaced = node.namespace.is_some();
        let idx = self.nodes.len();
        self.by_id.insert(node.id.clone(), idx);
        self.nodes.push(node);
        self.namespaced.push(namespaced);
        idx
    }

    fn lookup(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<usize> {
        let id = format!("{}/{}/{}", kind, namespace.unwrap_or(""), name);
        self.by_id.get(&id).copied()
    }
}

/// Derive the graph for one `(view, namespace)` projection. Deterministic:
/// equal snapshots produce structurally equal graphs.
pub fn build_topology(
    state: &[(String, Arc<KindIndex>)],
    view: ViewMode,
    namespace: Option<&str>,
    generation: u64,
) -> Topology {
    let mut arena = Arena::new();
    let mut objects: Vec<(String, Arc<Value>)> = Vec::new();

    for (kind, index) in state {
        if NON_GRAPH_KINDS.contains(&kind.as_str()) {
            continue;
        }
        for ((obj_ns, _), obj) in &index.objects {
            // Namespaced objects outside the filter are invisible;
            // cluster-scoped ones stay until the reference prune below.
            if let (Some(filter), Some(ns)) = (namespace, obj_ns.as_deref()) {
                if ns != filter {
                    continue;
                }
            }
            objects.push((kind.clone(), Arc::clone(obj)));
        }
    }
    objects.sort_by(|a, b| {
        let ka = node_id(&a.0, &a.1);
        let kb = node_id(&b.0, &b.1);
        ka.cmp(&kb)
    });

    for (kind, obj) in &objects {
        arena.insert(to_node(kind, obj));
    }

    let mut edges: std::collections::BTreeSet<(usize, usize, EdgeRelation)> =
        std::collections::BTreeSet::new();
    for (kind, obj) in &objects {
        let ns = meta::namespace(obj);
        let Some(self_idx) = arena.lookup(kind, ns, meta::name(obj)) else {
            continue;
        };

        // Ownership. The resources view follows every controller edge; the
        // traffic view keeps only the workload-to-pod ones so the graph
        // stays readable.
        if let Some(owner) = meta::controller_owner(obj) {
            let follow = match view {
                ViewMode::Resources => true,
                ViewMode::Traffic => kind == "Pod" && POD_OWNER_KINDS.contains(&owner.kind.as_str()),
            };
            if follow {
                if let Some(owner_idx) = arena.lookup(&owner.kind, ns, &owner.name) {
                    edges.insert((owner_idx, self_idx, EdgeRelation::Owns));
                }
            }
        }

        // Mounts are emitted in both modes.
        if kind == "Pod" {
            for (target_kind, target_name) in pod_mounts(obj) {
                if let Some(target_idx) = arena.lookup(&target_kind, ns, &target_name) {
                    edges.insert((self_idx, target_idx, EdgeRelation::Mounts));
                }
            }
        }

        if view == ViewMode::Traffic {
            match kind.as_str() {
                "Ingress" => {
                    for svc in ingress_backends(obj) {
                        if let Some(svc_idx) = arena.lookup("Service", ns, &svc) {
                            edges.insert((self_idx, svc_idx, EdgeRelation::Routes));
                        }
                    }
                }
                "Service" => {
                    if let Some(selector) = nested::field(obj, &["spec", "selector"])
                        .and_then(|s| s.as_object())
                    {
                        if !selector.is_empty() {
                            for (pod_kind, pod) in &objects {
                                if pod_kind != "Pod" || meta::namespace(pod) != ns {
                                    continue;
                                }
                                if selector_matches(selector, pod) {
                                    if let Some(pod_idx) =
                                        arena.lookup("Pod", ns, meta::name(pod))
                                    {
                                        edges.insert((self_idx, pod_idx, EdgeRelation::Selects));
                                    }
                                }
                            }
                        }
                    }
                }
                "HorizontalPodAutoscaler" => {
                    let target_kind = nested::str_field(obj, &["spec", "scaleTargetRef", "kind"]);
                    let target_name = nested::str_field(obj, &["spec", "scaleTargetRef", "name"]);
                    if let (Some(tk), Some(tn)) = (target_kind, target_name) {
                        if let Some(target_idx) = arena.lookup(tk, ns, tn) {
                            edges.insert((self_idx, target_idx, EdgeRelation::Scales));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // Under a namespace filter, cluster-scoped nodes stay only when an edge
    // ties them to the namespace.
    let keep: Vec<bool> = if namespace.is_some() {
        let mut keep = arena.namespaced.clone();
        for (a, b, _) in &edges {
            if arena.namespaced[*a] || arena.namespaced[*b] {
                keep[*a] = true;
                keep[*b] = true;
            }
        }
        keep
    } else {
        vec![true; arena.nodes.len()]
    };

    let nodes: Vec<TopologyNode> = arena
        .nodes
        .iter()
        .enumerate()
        .filter(|(idx, _)| keep[*idx])
        .map(|(_, n)| n.clone())
        .collect();
    let mut edge_list: Vec<TopologyEdge> = edges
        .into_iter()
        .filter(|(a, b, _)| keep[*a] && keep[*b])
        .map(|(a, b, relation)| TopologyEdge {
            source: arena.nodes[a].id.clone(),
            target: arena.nodes[b].id.clone(),
            relation,
        })
        .collect();
    edge_list.sort();

    Topology {
        nodes,
        edges: edge_list,
        view: Some(view),
        namespace: namespace.map(|s| s.to_string()),
        generation,
    }
}

fn node_id(kind: &str, obj: &Value) -> String {
    format!(
        "{}/{}/{}",
        kind,
        meta::namespace(obj).unwrap_or(""),
        meta::name(obj)
    )
}

fn to_node(kind: &str, obj: &Value) -> TopologyNode {
    TopologyNode {
        id: node_id(kind, obj),
        kind: kind.to_string(),
        name: meta::name(obj).to_string(),
        namespace: meta::namespace(obj).map(|s| s.to_string()),
        status: status_text(kind, obj),
        health: health_of(kind, obj),
        labels: meta::labels(obj),
        annotations: meta::annotations(obj),
        created: meta::creation_timestamp(obj).map(|s| s.to_string()),
    }
}

fn health_of(kind: &str, obj: &Value) -> HealthState {
    health::evaluate(kind, obj)
}

fn status_text(kind: &str, obj: &Value) -> Option<String> {
    if kind == "Pod" {
        return nested::str_field(obj, &["status", "phase"]).map(|s| s.to_string());
    }
    if health::replica_bearing(kind) {
        return health::ready_desired(kind, obj).map(|(r, d)| format!("{}/{}", r, d));
    }
    if kind == "Node" {
        return Some(if nested::condition_true(obj, "Ready") {
            "Ready".to_string()
        } else {
            "NotReady".to_string()
        });
    }
    None
}

/// Config maps, secrets and claims a pod mounts through volumes or envFrom.
fn pod_mounts(pod: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(volumes) = nested::array_field(pod, &["spec", "volumes"]) {
        for vol in volumes {
            if let Some(name) = nested::str_field(vol, &["configMap", "name"]) {
                out.push(("ConfigMap".to_string(), name.to_string()));
            }
            if let Some(name) = nested::str_field(vol, &["secret", "secretName"]) {
                out.push(("Secret".to_string(), name.to_string()));
            }
            if let Some(name) = nested::str_field(vol, &["persistentVolumeClaim", "claimName"]) {
                out.push(("PersistentVolumeClaim".to_string(), name.to_string()));
            }
        }
    }
    if let Some(containers) = nested::array_field(pod, &["spec", "containers"]) {
        for container in containers {
            if let Some(env_from) = container.get("envFrom").and_then(|e| e.as_array()) {
                for source in env_from {
                    if let Some(name) = nested::str_field(source, &["configMapRef", "name"]) {
                        out.push(("ConfigMap".to_string(), name.to_string()));
                    }
                    if let Some(name) = nested::str_field(source, &["secretRef", "name"]) {
                        out.push(("Secret".to_string(), name.to_string()));
                    }
                }
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

/// Service names an ingress routes to, across rules and the default backend.
fn ingress_backends(ingress: &Value) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(name) =
        nested::str_field(ingress, &["spec", "defaultBackend", "service", "name"])
    {
        out.push(name.to_string());
    }
    if let Some(rules) = nested::array_field(ingress, &["spec", "rules"]) {
        for rule in rules {
            if let Some(paths) = nested::array_field(rule, &["http", "paths"]) {
                for path in paths {
                    if let Some(name) = nested::str_field(path, &["backend", "service", "name"]) {
                        out.push(name.to_string());
                    }
                }
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

fn selector_matches(selector: &serde_json::Map<String, Value>, pod: &Value) -> bool {
    let labels = nested::field(pod, &["metadata", "labels"]).and_then(|l| l.as_object());
    let Some(labels) = labels else {
        return false;
    };
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}
