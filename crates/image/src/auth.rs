//! Credential chain for registry fetches. Anonymous is always tried first
//! by the caller; this module assembles the ordered fallbacks: image pull
//! secrets from the cluster, a registry-family source, then the local
//! docker config.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use serde::Deserialize;
use tracing::{debug, warn};

use vantage_kubehub::ClientHub;

use crate::reference::{detect_family, ImageRef, RegistryFamily};

#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    /// Which chain link produced this credential; reported on success.
    pub source: &'static str,
}

#[derive(Debug, Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: HashMap<String, DockerConfigEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct DockerConfigEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    auth: String,
}

impl DockerConfigEntry {
    fn credential(&self, source: &'static str) -> Option<Credential> {
        if !self.auth.is_empty() {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&self.auth)
                .ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (user, pass) = decoded.split_once(':')?;
            return Some(Credential {
                username: user.to_string(),
                password: pass.to_string(),
                source,
            });
        }
        if !self.username.is_empty() {
            return Some(Credential {
                username: self.username.clone(),
                password: self.password.clone(),
                source,
            });
        }
        None
    }
}

/// Registry host spellings that may appear as docker-config keys.
fn registry_aliases(registry: &str) -> Vec<String> {
    let mut out = vec![registry.to_string(), format!("https://{}", registry)];
    if registry == crate::reference::DEFAULT_REGISTRY || registry.contains("docker.io") {
        out.extend(
            [
                "https://index.docker.io/v1/",
                "https://index.docker.io/v2/",
                "index.docker.io",
                "docker.io",
            ]
            .map(String::from),
        );
    }
    out
}

fn lookup_entry<'a>(
    auths: &'a HashMap<String, DockerConfigEntry>,
    registry: &str,
) -> Option<&'a DockerConfigEntry> {
    registry_aliases(registry)
        .iter()
        .find_map(|alias| auths.get(alias))
}

/// Assemble the ordered credential list for one image.
pub async fn credential_chain(
    hub: Option<&Arc<ClientHub>>,
    image: &ImageRef,
    namespace: Option<&str>,
    pod: Option<&str>,
) -> Vec<Credential> {
    let mut chain = Vec::new();

    if let (Some(hub), Some(ns)) = (hub, namespace) {
        match pull_secret_credentials(hub, image, ns, pod).await {
            Ok(mut creds) => chain.append(&mut creds),
            Err(e) => debug!(error = %e, "pull-secret discovery failed"),
        }
    }

    if let Some(cred) = family_credential(image) {
        chain.push(cred);
    }

    if let Some(cred) = docker_config_credential(image) {
        chain.push(cred);
    }

    chain
}

/// Pull secrets named on the pod spec and its service account, fetched live
/// (the mirror keeps secrets metadata-only).
async fn pull_secret_credentials(
    hub: &Arc<ClientHub>,
    image: &ImageRef,
    namespace: &str,
    pod: Option<&str>,
) -> anyhow::Result<Vec<Credential>> {
    let mut secret_names: Vec<String> = Vec::new();
    if let Some(pod_name) = pod {
        let api = hub.dynamic_api("v1/Pod", Some(namespace)).await?;
        let pod_obj = api.get(pod_name).await?;
        let v = serde_json::to_value(&pod_obj)?;
        if let Some(refs) = vantage_core::nested::array_field(&v, &["spec", "imagePullSecrets"]) {
            for r in refs {
                if let Some(name) = r.get("name").and_then(|n| n.as_str()) {
                    secret_names.push(name.to_string());
                }
            }
        }
        let sa_name = vantage_core::nested::str_field(&v, &["spec", "serviceAccountName"])
            .unwrap_or("default")
            .to_string();
        if let Ok(sa_api) = hub.dynamic_api("v1/ServiceAccount", Some(namespace)).await {
            if let Ok(sa) = sa_api.get(&sa_name).await {
                let sv = serde_json::to_value(&sa)?;
                if let Some(refs) = sv.get("imagePullSecrets").and_then(|x| x.as_array()) {
                    for r in refs {
                        if let Some(name) = r.get("name").and_then(|n| n.as_str()) {
                            secret_names.push(name.to_string());
                        }
                    }
                }
            }
        }
    }
    secret_names.dedup();

    let mut out = Vec::new();
    if secret_names.is_empty() {
        return Ok(out);
    }
    let secret_api = hub.dynamic_api("v1/Secret", Some(namespace)).await?;
    for name in secret_names {
        let secret = match secret_api.get(&name).await {
            Ok(s) => s,
            Err(e) => {
                warn!(secret = %name, error = %e, "pull secret unreadable; skipping");
                continue;
            }
        };
        let v = serde_json::to_value(&secret)?;
        if v.get("type").and_then(|t| t.as_str()) != Some("kubernetes.io/dockerconfigjson") {
            continue;
        }
        let Some(data) = vantage_core::nested::str_field(&v, &["data", ".dockerconfigjson"]) else {
            continue;
        };
        let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(data) else {
            continue;
        };
        let Ok(config) = serde_json::from_slice::<DockerConfigJson>(&raw) else {
            continue;
        };
        if let Some(cred) = lookup_entry(&config.auths, &image.registry)
            .and_then(|e| e.credential("pull-secret"))
        {
            out.push(cred);
        }
    }
    Ok(out)
}

/// Family-specific ambient credentials, by convention: an OAuth access
/// token for Google registries, the token env vars for GitHub/GitLab.
fn family_credential(image: &ImageRef) -> Option<Credential> {
    match detect_family(&image.registry) {
        RegistryFamily::Google => std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .ok()
            .map(|token| Credential {
                username: "oauth2accesstoken".to_string(),
                password: token,
                source: "google",
            }),
        RegistryFamily::GitHub => std::env::var("GITHUB_TOKEN").ok().map(|token| Credential {
            username: "oauth2".to_string(),
            password: token,
            source: "github",
        }),
        RegistryFamily::GitLab => std::env::var("CI_JOB_TOKEN").ok().map(|token| Credential {
            username: "gitlab-ci-token".to_string(),
            password: token,
            source: "gitlab",
        }),
        _ => None,
    }
}

/// `~/.docker/config.json` auths, matched against the registry host.
fn docker_config_credential(image: &ImageRef) -> Option<Credential> {
    let home = std::env::var_os("HOME")?;
    let path = std::path::PathBuf::from(home).join(".docker/config.json");
    let raw = std::fs::read(path).ok()?;
    let config: DockerConfigJson = serde_json::from_slice(&raw).ok()?;
    lookup_entry(&config.auths, &image.registry).and_then(|e| e.credential("docker-config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_field_decodes_user_pass() {
        let entry = DockerConfigEntry {
            auth: base64::engine::general_purpose::STANDARD.encode("bot:hunter2"),
            ..Default::default()
        };
        let cred = entry.credential("test").unwrap();
        assert_eq!(cred.username, "bot");
        assert_eq!(cred.password, "hunter2");
    }

    #[test]
    fn username_password_fallback() {
        let entry = DockerConfigEntry {
            username: "bot".into(),
            password: "pw".into(),
            ..Default::default()
        };
        assert!(entry.credential("test").is_some());
        assert!(DockerConfigEntry::default().credential("test").is_none());
    }

    #[test]
    fn docker_hub_aliases_match() {
        let mut auths = HashMap::new();
        auths.insert(
            "https://index.docker.io/v1/".to_string(),
            DockerConfigEntry {
                username: "bot".into(),
                password: "pw".into(),
                ..Default::default()
            },
        );
        assert!(lookup_entry(&auths, crate::reference::DEFAULT_REGISTRY).is_some());
        assert!(lookup_entry(&auths, "ghcr.io").is_none());
    }
}
