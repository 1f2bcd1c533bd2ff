//! Package-release operations behind a pluggable engine seam. The default
//! engine works directly against Helm's secret storage
//! (`sh.helm.release.v1.<name>.v<n>`), which covers every read path and the
//! storage-level mutations without shelling out.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod storage;

pub use storage::SecretStorageEngine;

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("release not found: {0}")]
    NotFound(String),
    #[error("unsupported by this engine: {0}")]
    Unsupported(String),
    #[error("release storage: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSummary {
    pub name: String,
    pub namespace: String,
    pub chart: String,
    #[serde(rename = "chartVersion")]
    pub chart_version: String,
    #[serde(rename = "appVersion")]
    pub app_version: String,
    pub status: String,
    pub revision: i64,
    pub updated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRevision {
    pub revision: i64,
    pub status: String,
    pub chart: String,
    #[serde(rename = "appVersion")]
    pub app_version: String,
    pub description: String,
    pub updated: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseHook {
    pub name: String,
    pub kind: String,
    pub events: Vec<String>,
    pub weight: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartDependency {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseDetail {
    #[serde(flatten)]
    pub summary: ReleaseSummary,
    pub description: String,
    pub notes: String,
    pub history: Vec<ReleaseRevision>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<ReleaseHook>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ChartDependency>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseValues {
    #[serde(rename = "userSupplied")]
    pub user_supplied: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestDiff {
    pub revision1: i64,
    pub revision2: i64,
    pub diff: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeInfo {
    #[serde(rename = "currentVersion")]
    pub current_version: String,
    #[serde(rename = "latestVersion", skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    #[serde(rename = "updateAvailable")]
    pub update_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The seam to the release machinery. The HTTP layer talks only to this
/// trait; mutating operations are additionally capability-gated there.
#[async_trait]
pub trait ReleaseEngine: Send + Sync {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ReleaseSummary>, ReleaseError>;
    async fn get(&self, namespace: &str, name: &str) -> Result<ReleaseDetail, ReleaseError>;
    async fn history(&self, namespace: &str, name: &str)
        -> Result<Vec<ReleaseRevision>, ReleaseError>;
    async fn manifest(
        &self,
        namespace: &str,
        name: &str,
        revision: Option<i64>,
    ) -> Result<String, ReleaseError>;
    async fn values(&self, namespace: &str, name: &str, all: bool)
        -> Result<ReleaseValues, ReleaseError>;
    async fn diff(
        &self,
        namespace: &str,
        name: &str,
        revision1: i64,
        revision2: i64,
    ) -> Result<ManifestDiff, ReleaseError>;
    async fn rollback(&self, namespace: &str, name: &str, revision: i64)
        -> Result<(), ReleaseError>;
    async fn upgrade(&self, namespace: &str, name: &str, chart: &str)
        -> Result<(), ReleaseError>;
    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), ReleaseError>;
    async fn upgrade_check(&self, namespace: &str, name: &str)
        -> Result<UpgradeInfo, ReleaseError>;
}

/// Minimal line diff for manifests: common prefix/suffix elided, the
/// changed middle shown as removed/added blocks.
pub(crate) fn line_diff(a: &str, b: &str) -> String {
    if a == b {
        return String::new();
    }
    let a_lines: Vec<&str> = a.lines().collect();
    let b_lines: Vec<&str> = b.lines().collect();
    let mut start = 0;
    while start < a_lines.len() && start < b_lines.len() && a_lines[start] == b_lines[start] {
        start += 1;
    }
    let mut end = 0;
    while end < a_lines.len() - start
        && end < b_lines.len() - start
        && a_lines[a_lines.len() - 1 - end] == b_lines[b_lines.len() - 1 - end]
    {
        end += 1;
    }
    let mut out = String::new();
    for line in &a_lines[start..a_lines.len() - end] {
        out.push_str("- ");
        out.push_str(line);
        out.push('\n');
    }
    for line in &b_lines[start..b_lines.len() - end] {
        out.push_str("+ ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_manifests_diff_empty() {
        assert_eq!(line_diff("a\nb\n", "a\nb\n"), "");
    }

    #[test]
    fn changed_middle_is_isolated() {
        let a = "kind: Deployment\nreplicas: 2\nimage: app:1\n";
        let b = "kind: Deployment\nreplicas: 3\nimage: app:1\n";
        let d = line_diff(a, b);
        assert_eq!(d, "- replicas: 2\n+ replicas: 3\n");
    }

    #[test]
    fn additions_only() {
        let a = "a\n";
        let b = "a\nb\n";
        assert_eq!(line_diff(a, b), "+ b\n");
    }
}
