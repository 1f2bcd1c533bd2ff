//! Engine backed by Helm's secret storage. Each revision lives in a secret
//! `sh.helm.release.v1.<name>.v<revision>` whose `release` key holds
//! base64(gzip(json)), doubly base64-encoded on the wire.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use kube::api::{ListParams, PostParams};
use serde::Deserialize;
use tracing::{debug, info, warn};

use vantage_kubehub::ClientHub;

use crate::{
    line_diff, ChartDependency, ManifestDiff, ReleaseDetail, ReleaseEngine, ReleaseError,
    ReleaseHook, ReleaseRevision, ReleaseSummary, ReleaseValues, UpgradeInfo,
};

const STORAGE_PREFIX: &str = "sh.helm.release.v1.";
const OWNER_LABEL: &str = "owner=helm";

#[derive(Debug, Clone, Deserialize)]
struct ReleaseBlob {
    name: String,
    #[serde(default)]
    namespace: String,
    version: i64,
    #[serde(default)]
    info: ReleaseInfo,
    #[serde(default)]
    chart: Option<ChartBlob>,
    #[serde(default)]
    config: Option<serde_json::Value>,
    #[serde(default)]
    manifest: String,
    #[serde(default)]
    hooks: Vec<HookBlob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ReleaseInfo {
    #[serde(default)]
    status: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    last_deployed: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChartBlob {
    #[serde(default)]
    metadata: Option<ChartMetadata>,
    #[serde(default)]
    values: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChartMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(rename = "appVersion", default)]
    app_version: String,
    #[serde(default)]
    dependencies: Vec<DependencyBlob>,
}

#[derive(Debug, Clone, Deserialize)]
struct DependencyBlob {
    #[serde(default)]
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    repository: Option<String>,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct HookBlob {
    #[serde(default)]
    name: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    weight: i64,
}

struct StoredRelease {
    namespace: String,
    blob: ReleaseBlob,
}

pub struct SecretStorageEngine {
    hub: Arc<ClientHub>,
}

impl SecretStorageEngine {
    pub fn new(hub: Arc<ClientHub>) -> Arc<Self> {
        Arc::new(Self { hub })
    }

    async fn load(
        &self,
        namespace: Option<&str>,
        release: Option<&str>,
    ) -> Result<Vec<StoredRelease>, ReleaseError> {
        let api = self
            .hub
            .dynamic_api("v1/Secret", namespace)
            .await
            .map_err(|e| ReleaseError::Storage(e.to_string()))?;
        let mut selector = OWNER_LABEL.to_string();
        if let Some(name) = release {
            selector.push_str(&format!(",name={}", name));
        }
        let list = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| ReleaseError::Storage(e.to_string()))?;

        let mut out = Vec::new();
        for secret in list.items {
            let v = match serde_json::to_value(&secret) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let name = vantage_core::meta::name(&v);
            if !name.starts_with(STORAGE_PREFIX) {
                continue;
            }
            let ns = vantage_core::meta::namespace(&v).unwrap_or_default().to_string();
            match decode_release(&v) {
                Ok(blob) => out.push(StoredRelease {
                    namespace: ns,
                    blob,
                }),
                Err(e) => {
                    warn!(secret = %name, error = %e, "undecodable release record; skipping");
                }
            }
        }
        out.sort_by(|a, b| {
            (&a.namespace, &a.blob.name, a.blob.version)
                .cmp(&(&b.namespace, &b.blob.name, b.blob.version))
        });
        Ok(out)
    }

    async fn load_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<StoredRelease>, ReleaseError> {
        let records = self.load(Some(namespace), Some(name)).await?;
        if records.is_empty() {
            return Err(ReleaseError::NotFound(format!("{}/{}", namespace, name)));
        }
        Ok(records)
    }
}

fn summary_of(record: &StoredRelease) -> ReleaseSummary {
    let meta = record
        .blob
        .chart
        .as_ref()
        .and_then(|c| c.metadata.clone())
        .unwrap_or_default();
    ReleaseSummary {
        name: record.blob.name.clone(),
        namespace: if record.blob.namespace.is_empty() {
            record.namespace.clone()
        } else {
            record.blob.namespace.clone()
        },
        chart: meta.name,
        chart_version: meta.version,
        app_version: meta.app_version,
        status: record.blob.info.status.clone(),
        revision: record.blob.version,
        updated: record.blob.info.last_deployed,
    }
}

fn revision_of(record: &StoredRelease) -> ReleaseRevision {
    let meta = record
        .blob
        .chart
        .as_ref()
        .and_then(|c| c.metadata.clone())
        .unwrap_or_default();
    ReleaseRevision {
        revision: record.blob.version,
        status: record.blob.info.status.clone(),
        chart: if meta.version.is_empty() {
            meta.name
        } else {
            format!("{}-{}", meta.name, meta.version)
        },
        app_version: meta.app_version,
        description: record.blob.info.description.clone(),
        updated: record.blob.info.last_deployed,
    }
}

/// Secret data `release` key: outer base64 (the secret payload), inner
/// base64 (helm's storage driver), then gzip around the release JSON.
fn decode_release_bytes(secret: &serde_json::Value) -> Result<Vec<u8>, ReleaseError> {
    let data = vantage_core::nested::str_field(secret, &["data", "release"])
        .ok_or_else(|| ReleaseError::Storage("secret has no release key".to_string()))?;
    let outer = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| ReleaseError::Storage(format!("outer base64: {}", e)))?;
    let inner = base64::engine::general_purpose::STANDARD
        .decode(&outer)
        .map_err(|e| ReleaseError::Storage(format!("inner base64: {}", e)))?;
    if inner.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = flate2::read::GzDecoder::new(&inner[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ReleaseError::Storage(format!("gunzip: {}", e)))?;
        Ok(out)
    } else {
        Ok(inner)
    }
}

fn decode_release(secret: &serde_json::Value) -> Result<ReleaseBlob, ReleaseError> {
    let json = decode_release_bytes(secret)?;
    serde_json::from_slice(&json).map_err(|e| ReleaseError::Storage(format!("release json: {}", e)))
}

fn encode_release(blob: &serde_json::Value) -> Result<String, ReleaseError> {
    use flate2::write::GzEncoder;
    use std::io::Write;
    let json = serde_json::to_vec(blob)
        .map_err(|e| ReleaseError::Storage(format!("release json: {}", e)))?;
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| ReleaseError::Storage(format!("gzip: {}", e)))?;
    let gz = encoder
        .finish()
        .map_err(|e| ReleaseError::Storage(format!("gzip: {}", e)))?;
    Ok(base64::engine::general_purpose::STANDARD
        .encode(base64::engine::general_purpose::STANDARD.encode(gz)))
}

#[async_trait]
impl ReleaseEngine for SecretStorageEngine {
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ReleaseSummary>, ReleaseError> {
        let records = self.load(namespace, None).await?;
        // Latest revision per (namespace, name); records arrive sorted.
        let mut out: Vec<ReleaseSummary> = Vec::new();
        for record in &records {
            let summary = summary_of(record);
            match out
                .iter_mut()
                .find(|s| s.name == summary.name && s.namespace == summary.namespace)
            {
                Some(existing) if existing.revision < summary.revision => *existing = summary,
                Some(_) => {}
                None => out.push(summary),
            }
        }
        out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(out)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<ReleaseDetail, ReleaseError> {
        let records = self.load_release(namespace, name).await?;
        let latest = records.last().expect("load_release is non-empty");
        let meta = latest
            .blob
            .chart
            .as_ref()
            .and_then(|c| c.metadata.clone())
            .unwrap_or_default();
        Ok(ReleaseDetail {
            summary: summary_of(latest),
            description: latest.blob.info.description.clone(),
            notes: latest.blob.info.notes.clone(),
            history: records.iter().rev().map(revision_of).collect(),
            hooks: latest
                .blob
                .hooks
                .iter()
                .map(|h| ReleaseHook {
                    name: h.name.clone(),
                    kind: h.kind.clone(),
                    events: h.events.clone(),
                    weight: h.weight,
                })
                .collect(),
            dependencies: meta
                .dependencies
                .iter()
                .map(|d| ChartDependency {
                    name: d.name.clone(),
                    version: d.version.clone(),
                    repository: d.repository.clone(),
                    condition: d.condition.clone(),
                })
                .collect(),
        })
    }

    async fn history(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<ReleaseRevision>, ReleaseError> {
        let records = self.load_release(namespace, name).await?;
        Ok(records.iter().rev().map(revision_of).collect())
    }

    async fn manifest(
        &self,
        namespace: &str,
        name: &str,
        revision: Option<i64>,
    ) -> Result<String, ReleaseError> {
        let records = self.load_release(namespace, name).await?;
        let record = match revision {
            Some(rev) => records
                .iter()
                .find(|r| r.blob.version == rev)
                .ok_or_else(|| {
                    ReleaseError::NotFound(format!("{}/{} revision {}", namespace, name, rev))
                })?,
            None => records.last().expect("non-empty"),
        };
        Ok(record.blob.manifest.clone())
    }

    async fn values(
        &self,
        namespace: &str,
        name: &str,
        all: bool,
    ) -> Result<ReleaseValues, ReleaseError> {
        let records = self.load_release(namespace, name).await?;
        let latest = records.last().expect("non-empty");
        let user = latest
            .blob
            .config
            .clone()
            .unwrap_or(serde_json::Value::Object(Default::default()));
        let computed = if all {
            // Chart defaults with user values layered on top.
            let defaults = latest
                .blob
                .chart
                .as_ref()
                .and_then(|c| c.values.clone())
                .unwrap_or(serde_json::Value::Object(Default::default()));
            Some(merge_values(defaults, &user))
        } else {
            None
        };
        Ok(ReleaseValues {
            user_supplied: user,
            computed,
        })
    }

    async fn diff(
        &self,
        namespace: &str,
        name: &str,
        revision1: i64,
        revision2: i64,
    ) -> Result<ManifestDiff, ReleaseError> {
        let a = self.manifest(namespace, name, Some(revision1)).await?;
        let b = self.manifest(namespace, name, Some(revision2)).await?;
        Ok(ManifestDiff {
            revision1,
            revision2,
            diff: line_diff(&a, &b),
        })
    }

    /// Storage-level rollback: a superseding revision that reuses the
    /// target revision's chart, values and manifest.
    async fn rollback(
        &self,
        namespace: &str,
        name: &str,
        revision: i64,
    ) -> Result<(), ReleaseError> {
        let api = self
            .hub
            .dynamic_api("v1/Secret", Some(namespace))
            .await
            .map_err(|e| ReleaseError::Storage(e.to_string()))?;
        let records = self.load_release(namespace, name).await?;
        let target_secret_name = format!("{}{}.v{}", STORAGE_PREFIX, name, revision);
        let target = api
            .get(&target_secret_name)
            .await
            .map_err(|_| ReleaseError::NotFound(format!("{}/{} revision {}", namespace, name, revision)))?;
        let target_value = serde_json::to_value(&target)
            .map_err(|e| ReleaseError::Storage(e.to_string()))?;
        let raw = decode_release_bytes(&target_value)?;
        let mut blob: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| ReleaseError::Storage(format!("release json: {}", e)))?;

        let next_version = records.last().expect("non-empty").blob.version + 1;
        blob["version"] = serde_json::json!(next_version);
        blob["info"]["status"] = serde_json::json!("deployed");
        blob["info"]["description"] = serde_json::json!(format!("Rollback to {}", revision));
        blob["info"]["last_deployed"] = serde_json::json!(chrono::Utc::now());

        let encoded = encode_release(&blob)?;
        let secret = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "helm.sh/release.v1",
            "metadata": {
                "name": format!("{}{}.v{}", STORAGE_PREFIX, name, next_version),
                "namespace": namespace,
                "labels": {
                    "name": name,
                    "owner": "helm",
                    "status": "deployed",
                    "version": next_version.to_string(),
                },
            },
            "data": { "release": encoded },
        });
        let obj: kube::core::DynamicObject = serde_json::from_value(secret)
            .map_err(|e| ReleaseError::Storage(e.to_string()))?;
        api.create(&PostParams::default(), &obj)
            .await
            .map_err(|e| ReleaseError::Storage(e.to_string()))?;
        info!(ns = %namespace, release = %name, revision, next_version, "rollback recorded");
        Ok(())
    }

    async fn upgrade(&self, namespace: &str, name: &str, chart: &str) -> Result<(), ReleaseError> {
        debug!(ns = %namespace, release = %name, chart = %chart, "upgrade requested");
        Err(ReleaseError::Unsupported(
            "upgrade needs chart repository access".to_string(),
        ))
    }

    /// Remove the release's storage records. Installed resources are left
    /// in place.
    async fn uninstall(&self, namespace: &str, name: &str) -> Result<(), ReleaseError> {
        let api = self
            .hub
            .dynamic_api("v1/Secret", Some(namespace))
            .await
            .map_err(|e| ReleaseError::Storage(e.to_string()))?;
        let records = self.load_release(namespace, name).await?;
        for record in &records {
            let secret_name = format!("{}{}.v{}", STORAGE_PREFIX, name, record.blob.version);
            if let Err(e) = api
                .delete(&secret_name, &kube::api::DeleteParams::default())
                .await
            {
                warn!(secret = %secret_name, error = %e, "failed to delete release record");
            }
        }
        info!(ns = %namespace, release = %name, revisions = records.len(), "release records removed");
        Ok(())
    }

    async fn upgrade_check(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<UpgradeInfo, ReleaseError> {
        let records = self.load_release(namespace, name).await?;
        let latest = records.last().expect("non-empty");
        let current = latest
            .blob
            .chart
            .as_ref()
            .and_then(|c| c.metadata.as_ref())
            .map(|m| m.version.clone())
            .unwrap_or_default();
        Ok(UpgradeInfo {
            current_version: current,
            latest_version: None,
            update_available: false,
            error: Some("no chart repository configured".to_string()),
        })
    }
}

/// Shallow-to-deep merge of user values over chart defaults.
fn merge_values(defaults: serde_json::Value, user: &serde_json::Value) -> serde_json::Value {
    match (defaults, user) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(over)) => {
            for (k, v) in over {
                let merged = match base.remove(k) {
                    Some(existing) => merge_values(existing, v),
                    None => v.clone(),
                };
                base.insert(k.clone(), merged);
            }
            serde_json::Value::Object(base)
        }
        (_, over) => over.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn storage_secret(name: &str, ns: &str, version: i64, status: &str) -> serde_json::Value {
        let blob = serde_json::json!({
            "name": name,
            "namespace": ns,
            "version": version,
            "info": {
                "status": status,
                "description": "Install complete",
                "notes": "welcome",
                "last_deployed": "2026-05-01T10:00:00Z",
            },
            "chart": {
                "metadata": {
                    "name": "demo-chart",
                    "version": "1.2.3",
                    "appVersion": "4.5.6",
                    "dependencies": [{"name": "postgres", "version": "12.0.0"}],
                },
                "values": {"replicas": 1, "image": {"tag": "stable"}},
            },
            "config": {"replicas": 3},
            "manifest": "kind: Deployment\n",
            "hooks": [{"name": "migrate", "kind": "Job", "events": ["pre-upgrade"], "weight": 0}],
        });
        let encoded = encode_release(&blob).unwrap();
        serde_json::json!({
            "metadata": {
                "name": format!("{}{}.v{}", STORAGE_PREFIX, name, version),
                "namespace": ns,
            },
            "data": {"release": encoded},
        })
    }

    #[test]
    fn decode_roundtrips_the_double_encoding() {
        let secret = storage_secret("web", "app", 2, "deployed");
        let blob = decode_release(&secret).unwrap();
        assert_eq!(blob.name, "web");
        assert_eq!(blob.version, 2);
        assert_eq!(blob.info.status, "deployed");
        assert_eq!(
            blob.chart.unwrap().metadata.unwrap().version,
            "1.2.3"
        );
    }

    #[test]
    fn decode_handles_uncompressed_payloads() {
        let json = serde_json::json!({"name": "web", "namespace": "app", "version": 1});
        let inner = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&json).unwrap());
        let outer = base64::engine::general_purpose::STANDARD.encode(inner);
        let secret = serde_json::json!({"metadata": {}, "data": {"release": outer}});
        let blob = decode_release(&secret).unwrap();
        assert_eq!(blob.name, "web");
    }

    #[test]
    fn decode_rejects_garbage() {
        let secret = serde_json::json!({"metadata": {}, "data": {"release": "!!notbase64!!"}});
        assert!(decode_release(&secret).is_err());
        let empty = serde_json::json!({"metadata": {}, "data": {}});
        assert!(decode_release(&empty).is_err());
    }

    #[test]
    fn merge_layers_user_values_over_defaults() {
        let defaults = serde_json::json!({"replicas": 1, "image": {"tag": "stable", "pullPolicy": "IfNotPresent"}});
        let user = serde_json::json!({"image": {"tag": "v2"}});
        let merged = merge_values(defaults, &user);
        assert_eq!(merged["replicas"], 1);
        assert_eq!(merged["image"]["tag"], "v2");
        assert_eq!(merged["image"]["pullPolicy"], "IfNotPresent");
    }

    #[test]
    fn summary_and_revision_projection() {
        let secret = storage_secret("web", "app", 7, "deployed");
        let record = StoredRelease {
            namespace: "app".to_string(),
            blob: decode_release(&secret).unwrap(),
        };
        let summary = summary_of(&record);
        assert_eq!(summary.chart, "demo-chart");
        assert_eq!(summary.revision, 7);
        let rev = revision_of(&record);
        assert_eq!(rev.chart, "demo-chart-1.2.3");
        assert_eq!(rev.description, "Install complete");
    }
}
