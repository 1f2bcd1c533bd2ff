//! OCI distribution client: manifest resolution with the token-auth
//! handshake, platform selection, and layer blob download with gzip
//! expansion to plain tars.

use std::collections::HashMap;
use std::path::Path;

use futures::StreamExt;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::auth::Credential;
use crate::reference::ImageRef;
use crate::ImageError;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

const DEFAULT_OS: &str = "linux";
const DEFAULT_ARCH: &str = "amd64";

#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    pub digest: String,
    pub media_type: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub registry: String,
    pub repository: String,
    pub digest: String,
    pub platform: String,
    pub layers: Vec<LayerDescriptor>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
    #[serde(rename = "mediaType", default)]
    media_type: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    platform: Option<PlatformDescriptor>,
}

#[derive(Debug, Deserialize)]
struct PlatformDescriptor {
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    config: Option<Descriptor>,
}

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Self {
        // No overall timeout: layer downloads are unbounded but cancellable
        // through the request future.
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self { http }
    }

    /// Resolve a reference to a concrete per-platform manifest, trying each
    /// credential in order until one is accepted.
    pub async fn resolve(
        &self,
        image: &ImageRef,
        chain: &[Credential],
    ) -> Result<(ResolvedImage, String), ImageError> {
        match self.try_resolve(image, None).await {
            Ok(resolved) => {
                info!(image = %image, "image accessible anonymously");
                Ok((resolved, "anonymous".to_string()))
            }
            Err(ImageError::Auth(first)) => {
                debug!(image = %image, error = %first, "anonymous access denied; trying credentials");
                for cred in chain {
                    match self.try_resolve(image, Some(cred)).await {
                        Ok(resolved) => {
                            info!(image = %image, source = cred.source, "image accessible with credentials");
                            return Ok((resolved, cred.source.to_string()));
                        }
                        Err(ImageError::Auth(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(ImageError::Auth(format!(
                    "no credential source grants access to {}",
                    image
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn try_resolve(
        &self,
        image: &ImageRef,
        cred: Option<&Credential>,
    ) -> Result<ResolvedImage, ImageError> {
        let mut token: Option<String> = None;
        let reference = image.manifest_reference();
        let (body, header_digest) = self
            .fetch_manifest(image, &reference, cred, &mut token)
            .await?;
        let doc: ManifestDocument = serde_json::from_slice(&body)
            .map_err(|e| ImageError::Registry(format!("manifest parse: {}", e)))?;

        let (doc, body, header_digest) = if doc.manifests.is_empty() {
            (doc, body, header_digest)
        } else {
            let picked = pick_platform(&doc.manifests).ok_or_else(|| {
                ImageError::Registry(format!("no {}/{} manifest in index", DEFAULT_OS, DEFAULT_ARCH))
            })?;
            let digest = picked.digest.clone();
            let (body, _) = self
                .fetch_manifest(image, &digest, cred, &mut token)
                .await?;
            let inner: ManifestDocument = serde_json::from_slice(&body)
                .map_err(|e| ImageError::Registry(format!("manifest parse: {}", e)))?;
            (inner, body, Some(digest))
        };

        if doc.layers.is_empty() {
            return Err(ImageError::Registry(format!(
                "manifest for {} carries no layers (mediaType {})",
                image, doc.media_type
            )));
        }

        let digest = header_digest
            .unwrap_or_else(|| format!("sha256:{:x}", Sha256::digest(&body)));

        let platform = match &doc.config {
            Some(config) => self
                .fetch_config(image, &config.digest, &token)
                .await
                .unwrap_or_else(|| format!("{}/{}", DEFAULT_OS, DEFAULT_ARCH)),
            None => format!("{}/{}", DEFAULT_OS, DEFAULT_ARCH),
        };

        Ok(ResolvedImage {
            registry: image.registry.clone(),
            repository: image.repository.clone(),
            digest,
            platform,
            layers: doc
                .layers
                .iter()
                .map(|l| LayerDescriptor {
                    digest: l.digest.clone(),
                    media_type: l.media_type.clone(),
                    size: l.size,
                })
                .collect(),
            token,
        })
    }

    async fn fetch_manifest(
        &self,
        image: &ImageRef,
        reference: &str,
        cred: Option<&Credential>,
        token: &mut Option<String>,
    ) -> Result<(Vec<u8>, Option<String>), ImageError> {
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            image.registry, image.repository, reference
        );
        for attempt in 0..2 {
            let mut req = self.http.get(&url).header("Accept", MANIFEST_ACCEPT);
            if let Some(t) = token.as_deref() {
                req = req.bearer_auth(t);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| ImageError::Registry(format!("manifest request: {}", e)))?;
            match resp.status().as_u16() {
                200 => {
                    let header_digest = resp
                        .headers()
                        .get("docker-content-digest")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|e| ImageError::Registry(format!("manifest body: {}", e)))?;
                    return Ok((body.to_vec(), header_digest));
                }
                401 if attempt == 0 => {
                    let challenge = resp
                        .headers()
                        .get("www-authenticate")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    *token = Some(self.acquire_token(image, challenge.as_deref(), cred).await?);
                }
                401 | 403 => {
                    return Err(ImageError::Auth(format!(
                        "registry denied access to {} ({})",
                        image,
                        resp.status()
                    )))
                }
                404 => {
                    return Err(ImageError::NotFound(format!("image not found: {}", image)))
                }
                code => {
                    return Err(ImageError::Registry(format!(
                        "manifest fetch failed with HTTP {}",
                        code
                    )))
                }
            }
        }
        Err(ImageError::Auth(format!("token rejected for {}", image)))
    }

    /// Token-auth handshake per the distribution spec: the 401 challenge
    /// names the realm/service/scope to request a bearer token from.
    async fn acquire_token(
        &self,
        image: &ImageRef,
        challenge: Option<&str>,
        cred: Option<&Credential>,
    ) -> Result<String, ImageError> {
        let params = challenge
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| ImageError::Auth("registry sent no bearer challenge".to_string()))?;
        let realm = params
            .get("realm")
            .ok_or_else(|| ImageError::Auth("bearer challenge without realm".to_string()))?;
        let mut req = self.http.get(realm).query(&[
            (
                "service",
                params.get("service").cloned().unwrap_or_default(),
            ),
            (
                "scope",
                params.get("scope").cloned().unwrap_or_else(|| {
                    format!("repository:{}:pull", image.repository)
                }),
            ),
        ]);
        if let Some(c) = cred {
            req = req.basic_auth(&c.username, Some(&c.password));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ImageError::Registry(format!("token request: {}", e)))?;
        if !resp.status().is_success() {
            return Err(ImageError::Auth(format!(
                "token endpoint refused ({})",
                resp.status()
            )));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ImageError::Registry(format!("token parse: {}", e)))?;
        let token = if body.token.is_empty() {
            body.access_token
        } else {
            body.token
        };
        if token.is_empty() {
            return Err(ImageError::Auth("token endpoint returned no token".to_string()));
        }
        Ok(token)
    }

    async fn fetch_config(
        &self,
        image: &ImageRef,
        digest: &str,
        token: &Option<String>,
    ) -> Option<String> {
        let url = format!(
            "https://{}/v2/{}/blobs/{}",
            image.registry, image.repository, digest
        );
        let mut req = self.http.get(&url);
        if let Some(t) = token.as_deref() {
            req = req.bearer_auth(t);
        }
        let resp = req.send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let config: ConfigDocument = resp.json().await.ok()?;
        if config.os.is_empty() {
            return None;
        }
        Some(format!("{}/{}", config.os, config.architecture))
    }

    /// Stream one layer blob to disk, expanding gzip so the cache always
    /// holds plain tars.
    pub async fn download_layer(
        &self,
        resolved: &ResolvedImage,
        layer: &LayerDescriptor,
        dest: &Path,
    ) -> Result<(), ImageError> {
        let url = format!(
            "https://{}/v2/{}/blobs/{}",
            resolved.registry, resolved.repository, layer.digest
        );
        let mut req = self.http.get(&url);
        if let Some(t) = resolved.token.as_deref() {
            req = req.bearer_auth(t);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ImageError::Registry(format!("blob request: {}", e)))?;
        if resp.status().as_u16() == 404 {
            return Err(ImageError::NotFound(format!("blob missing: {}", layer.digest)));
        }
        if !resp.status().is_success() {
            return Err(ImageError::Registry(format!(
                "blob fetch failed with HTTP {}",
                resp.status()
            )));
        }

        let part = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| ImageError::Registry(format!("creating layer file: {}", e)))?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ImageError::Registry(format!("blob stream: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ImageError::Registry(format!("writing layer: {}", e)))?;
        }
        file.flush()
            .await
            .map_err(|e| ImageError::Registry(format!("flushing layer: {}", e)))?;
        drop(file);

        if layer.media_type.contains("gzip") || layer.media_type.ends_with("+gzip") {
            let part_path = part.clone();
            let dest_path = dest.to_path_buf();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let input = std::fs::File::open(&part_path)?;
                let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(input));
                let mut out = std::io::BufWriter::new(std::fs::File::create(&dest_path)?);
                std::io::copy(&mut decoder, &mut out)?;
                std::fs::remove_file(&part_path)?;
                Ok(())
            })
            .await
            .map_err(|_| ImageError::Cancelled)?
            .map_err(|e| ImageError::Registry(format!("decompressing layer: {}", e)))?;
        } else {
            tokio::fs::rename(&part, dest)
                .await
                .map_err(|e| ImageError::Registry(format!("placing layer: {}", e)))?;
        }
        metrics::counter!("image_layers_downloaded_total", 1u64);
        Ok(())
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

fn pick_platform(manifests: &[Descriptor]) -> Option<&Descriptor> {
    manifests
        .iter()
        .find(|d| {
            d.platform
                .as_ref()
                .map(|p| p.os == DEFAULT_OS && p.architecture == DEFAULT_ARCH)
                .unwrap_or(false)
        })
        .or_else(|| {
            // Attestation entries advertise an "unknown" platform; skip them.
            manifests.iter().find(|d| {
                d.platform
                    .as_ref()
                    .map(|p| p.architecture != "unknown")
                    .unwrap_or(true)
            })
        })
}

fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut out = HashMap::new();
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        out.insert(key.to_string(), value.trim_matches('"').to_string());
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_challenge_parses() {
        let h = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        let params = parse_bearer_challenge(h).unwrap();
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/nginx:pull");
        assert!(parse_bearer_challenge("Basic realm=x").is_none());
    }

    #[test]
    fn platform_selection_prefers_linux_amd64_and_skips_attestations() {
        let manifests: Vec<Descriptor> = serde_json::from_value(serde_json::json!([
            {"digest": "sha256:att", "platform": {"os": "unknown", "architecture": "unknown"}},
            {"digest": "sha256:arm", "platform": {"os": "linux", "architecture": "arm64"}},
            {"digest": "sha256:amd", "platform": {"os": "linux", "architecture": "amd64"}},
        ]))
        .unwrap();
        assert_eq!(pick_platform(&manifests).unwrap().digest, "sha256:amd");

        let no_amd: Vec<Descriptor> = serde_json::from_value(serde_json::json!([
            {"digest": "sha256:att", "platform": {"os": "unknown", "architecture": "unknown"}},
            {"digest": "sha256:arm", "platform": {"os": "linux", "architecture": "arm64"}},
        ]))
        .unwrap();
        assert_eq!(pick_platform(&no_amd).unwrap().digest, "sha256:arm");
    }
}
