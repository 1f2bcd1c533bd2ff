//! Container image inspection: anonymous-first registry fetch with an auth
//! fallback chain, a TTL + LRU disk cache of uncompressed layers, and a
//! whiteout-aware filesystem reconstruction over them.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod auth;
pub mod cache;
pub mod fstree;
pub mod reference;
pub mod registry;

pub use cache::{LayerCache, LayerCacheMetadata};
pub use fstree::FileNode;
pub use reference::{ImageRef, RegistryFamily};

/// Inspection failures, categorised for the HTTP error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("auth: {0}")]
    Auth(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("cancelled")]
    Cancelled,
    #[error("limits_exceeded: {0}")]
    LimitsExceeded(String),
    #[error("registry: {0}")]
    Registry(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InspectRequest {
    pub image: String,
    /// Namespace + pod hint for pull-secret discovery.
    pub namespace: Option<String>,
    pub pod: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageMetadata {
    pub image: String,
    pub digest: String,
    pub platform: String,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    #[serde(rename = "layerCount")]
    pub layer_count: usize,
    pub cached: bool,
    #[serde(rename = "authMethod")]
    pub auth_method: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageFilesystem {
    pub image: String,
    pub digest: String,
    pub platform: String,
    pub root: FileNode,
    #[serde(rename = "totalFiles")]
    pub total_files: usize,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    #[serde(rename = "layerCount")]
    pub layer_count: usize,
}

pub struct ImageInspector {
    cache: Arc<LayerCache>,
    registry: registry::RegistryClient,
    hub: Option<Arc<vantage_kubehub::ClientHub>>,
}

impl ImageInspector {
    /// `hub` feeds pull-secret discovery; `None` limits the auth chain to
    /// local credentials.
    pub fn new(cache_root: PathBuf, hub: Option<Arc<vantage_kubehub::ClientHub>>) -> Arc<Self> {
        let cache = LayerCache::new(cache_root);
        cache.start_sweeper();
        Arc::new(Self {
            cache,
            registry: registry::RegistryClient::new(),
            hub,
        })
    }

    pub fn layer_cache(&self) -> &Arc<LayerCache> {
        &self.cache
    }

    /// Lightweight metadata; layers are downloaded only when already
    /// required for a cached filesystem.
    pub async fn metadata(&self, req: &InspectRequest) -> Result<ImageMetadata, ImageError> {
        let image = reference::parse(&req.image)?;
        let (resolved, auth_method) = self.resolve(&image, req).await?;
        if let Some(hit) = self.cache.lookup(&resolved.digest) {
            return Ok(ImageMetadata {
                image: req.image.clone(),
                digest: hit.meta.digest,
                platform: hit.meta.platform,
                total_size: hit.total_bytes,
                layer_count: hit.meta.layer_count,
                cached: true,
                auth_method: "cached".to_string(),
            });
        }
        Ok(ImageMetadata {
            image: req.image.clone(),
            digest: resolved.digest.clone(),
            platform: resolved.platform.clone(),
            total_size: resolved.layers.iter().map(|l| l.size).sum(),
            layer_count: resolved.layers.len(),
            cached: false,
            auth_method,
        })
    }

    /// Full filesystem tree, served from the layer cache when warm.
    pub async fn inspect(&self, req: &InspectRequest) -> Result<ImageFilesystem, ImageError> {
        let image = reference::parse(&req.image)?;
        let (resolved, _) = self.resolve(&image, req).await?;
        let (layer_paths, meta) = self.ensure_cached(&resolved, &req.image).await?;
        let (root, total_files, total_size) =
            tokio::task::spawn_blocking(move || fstree::build_tree(&layer_paths))
                .await
                .map_err(|_| ImageError::Cancelled)??;
        Ok(ImageFilesystem {
            image: req.image.clone(),
            digest: meta.digest,
            platform: meta.platform,
            root,
            total_files,
            total_size,
            layer_count: meta.layer_count,
        })
    }

    /// Content of one file: the highest layer wins, whiteouts read as
    /// not-found.
    pub async fn file(
        &self,
        req: &InspectRequest,
        path: &str,
    ) -> Result<(Vec<u8>, String), ImageError> {
        let image = reference::parse(&req.image)?;
        let (resolved, _) = self.resolve(&image, req).await?;
        let (layer_paths, _) = self.ensure_cached(&resolved, &req.image).await?;
        let path = path.to_string();
        tokio::task::spawn_blocking(move || fstree::read_file(&layer_paths, &path))
            .await
            .map_err(|_| ImageError::Cancelled)?
    }

    async fn resolve(
        &self,
        image: &ImageRef,
        req: &InspectRequest,
    ) -> Result<(registry::ResolvedImage, String), ImageError> {
        let chain = auth::credential_chain(
            self.hub.as_ref(),
            image,
            req.namespace.as_deref(),
            req.pod.as_deref(),
        )
        .await;
        self.registry.resolve(image, &chain).await
    }

    async fn ensure_cached(
        &self,
        resolved: &registry::ResolvedImage,
        image_ref: &str,
    ) -> Result<(Vec<PathBuf>, LayerCacheMetadata), ImageError> {
        if let Some(hit) = self.cache.lookup(&resolved.digest) {
            return Ok((hit.layer_paths, hit.meta));
        }
        let admission = self.cache.admit(&resolved.digest)?;
        let mut layer_paths = Vec::with_capacity(resolved.layers.len());
        for (idx, layer) in resolved.layers.iter().enumerate() {
            let dest = admission.layer_path(idx);
            if let Err(e) = self.registry.download_layer(resolved, layer, &dest).await {
                warn!(image = %image_ref, layer = idx, error = %e, "layer download failed");
                return Err(e);
            }
            layer_paths.push(dest);
        }
        let meta = LayerCacheMetadata {
            image_ref: image_ref.to_string(),
            digest: resolved.digest.clone(),
            platform: resolved.platform.clone(),
            layer_count: resolved.layers.len(),
            cached_at: chrono::Utc::now(),
        };
        admission.finalize(&meta)?;
        info!(image = %image_ref, digest = %resolved.digest, layers = meta.layer_count, "layers cached");
        Ok((layer_paths, meta))
    }
}
