//! Vantage core types: the shared model the mirror, history, topology and
//! HTTP layers exchange.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod health;
pub mod meta;
pub mod nested;

/// Raw object UID as stored in `metadata.uid`.
pub type Uid = [u8; 16];

/// Address of a single object in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: String,
    pub group: String,
    pub version: String,
    /// None for cluster-scoped kinds.
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    /// Stable node identifier: `kind/namespace/name` (namespace empty when
    /// cluster-scoped).
    pub fn node_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }
}

/// A served resource kind, discovered once per context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindDescriptor {
    pub group: String,
    pub version: String,
    /// Singular capitalised name, e.g. `Deployment`.
    pub kind: String,
    /// Plural lower-case resource name, e.g. `deployments`.
    pub plural: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
    pub is_custom: bool,
}

impl KindDescriptor {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn listable(&self) -> bool {
        self.verbs.iter().any(|v| v == "list")
    }

    pub fn watchable(&self) -> bool {
        self.verbs.iter().any(|v| v == "watch")
    }
}

/// Operation observed by a watcher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Add,
    Update,
    Delete,
}

/// Health of an object, derived purely from its own state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// One changed field inside an update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldDiff {
    pub path: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// Controller owner of an object, if any.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// Semantic change record derived from a watch delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "operation")]
    pub op: ChangeOp,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<Vec<FieldDiff>>,
    pub summary: String,
    /// `metadata.resourceVersion` of the object version that produced this
    /// record (the deleted version for deletes).
    pub resource_version: String,
}

/// Read-through projection of the cluster's native Event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reason: String,
    pub message: String,
    pub involved_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub involved_namespace: Option<String>,
    pub involved_name: String,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<String>,
    pub source: String,
}

impl ClusterEvent {
    /// Project a raw cluster Event object.
    pub fn from_raw(v: &serde_json::Value) -> Self {
        let source = match (
            nested::str_field(v, &["source", "component"]),
            nested::str_field(v, &["source", "host"]),
        ) {
            (Some(c), Some(h)) => format!("{}/{}", c, h),
            (Some(c), None) => c.to_string(),
            (None, Some(h)) => h.to_string(),
            (None, None) => nested::str_field(v, &["reportingComponent"])
                .unwrap_or("")
                .to_string(),
        };
        ClusterEvent {
            event_type: v
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("Normal")
                .to_string(),
            reason: v
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("")
                .to_string(),
            message: v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_string(),
            involved_kind: nested::str_field(v, &["involvedObject", "kind"])
                .unwrap_or("")
                .to_string(),
            involved_namespace: nested::str_field(v, &["involvedObject", "namespace"])
                .map(|s| s.to_string()),
            involved_name: nested::str_field(v, &["involvedObject", "name"])
                .unwrap_or("")
                .to_string(),
            count: v.get("count").and_then(|c| c.as_i64()).unwrap_or(1),
            first_timestamp: v
                .get("firstTimestamp")
                .and_then(|t| t.as_str())
                .map(|s| s.to_string()),
            last_timestamp: v
                .get("lastTimestamp")
                .and_then(|t| t.as_str())
                .map(|s| s.to_string()),
            source,
        }
    }
}

/// View modes of the derived graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    Resources,
    Traffic,
}

impl std::str::FromStr for ViewMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resources" | "" => Ok(ViewMode::Resources),
            "traffic" => Ok(ViewMode::Traffic),
            other => Err(format!("unknown view mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EdgeRelation {
    Owns,
    Selects,
    Routes,
    Mounts,
    Scales,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologyNode {
    /// `kind/namespace/name`; namespace empty for cluster-scoped kinds.
    pub id: String,
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub health: HealthState,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty", default)]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty", default)]
    pub annotations: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct TopologyEdge {
    pub source: String,
    pub target: String,
    pub relation: EdgeRelation,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Topology {
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
    pub view: Option<ViewMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Monotone per subscription; consumers may discard stale snapshots.
    pub generation: u64,
}

/// RBAC-derived feature switches, fail-closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub exec: bool,
    pub logs: bool,
    #[serde(rename = "portForward")]
    pub port_forward: bool,
    pub secrets: bool,
}

/// Parse `metadata.uid` into a fixed-size byte UID.
pub fn parse_uid(uid: &str) -> Option<Uid> {
    uuid::Uuid::parse_str(uid).ok().map(|u| *u.as_bytes())
}

pub mod prelude {
    pub use super::{
        Capabilities, ChangeOp, ChangeRecord, ClusterEvent, EdgeRelation, FieldDiff, HealthState,
        KindDescriptor, OwnerRef, ResourceRef, Topology, TopologyEdge, TopologyNode, Uid, ViewMode,
    };
}
