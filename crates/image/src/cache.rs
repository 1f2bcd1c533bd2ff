//! Disk-resident layer cache: `<root>/<digest>/metadata.json` plus
//! `layers/layer-<i>.tar`. Entries die by TTL, by LRU pressure at
//! admission, or at process startup when the whole directory is purged.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ImageError;

pub const LAYER_TTL_SECS: i64 = 300;
pub const MAX_CACHED_IMAGES: usize = 5;
const SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerCacheMetadata {
    #[serde(rename = "imageRef")]
    pub image_ref: String,
    pub digest: String,
    pub platform: String,
    #[serde(rename = "layerCount")]
    pub layer_count: usize,
    #[serde(rename = "cachedAt")]
    pub cached_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub meta: LayerCacheMetadata,
    pub layer_paths: Vec<PathBuf>,
    pub total_bytes: u64,
}

/// Filesystem-safe key: digest with ':' replaced.
fn cache_key(digest: &str) -> String {
    digest.replace(':', "-")
}

pub struct LayerCache {
    root: PathBuf,
    guard: RwLock<()>,
}

impl LayerCache {
    /// Purges and recreates the cache directory; every entry is
    /// reconstructable from the registry.
    pub fn new(root: PathBuf) -> Arc<Self> {
        if let Err(e) = std::fs::remove_dir_all(&root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to purge layer cache directory");
            }
        }
        if let Err(e) = std::fs::create_dir_all(&root) {
            warn!(error = %e, "failed to create layer cache directory");
        }
        info!(path = %root.display(), "image layer cache initialised");
        Arc::new(Self {
            root,
            guard: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn start_sweeper(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        });
    }

    /// A hit requires intact metadata and every layer file on disk; any
    /// failed check evicts the entry before returning a miss.
    pub fn lookup(&self, digest: &str) -> Option<CacheHit> {
        let key = cache_key(digest);
        let image_dir = self.root.join(&key);
        {
            let _read = self.guard.read().unwrap();
            if let Some(hit) = read_entry(&image_dir) {
                let age = chrono::Utc::now() - hit.meta.cached_at;
                if age.num_seconds() < LAYER_TTL_SECS {
                    return Some(hit);
                }
                debug!(digest = %digest, "cache entry expired");
            } else if !image_dir.exists() {
                return None;
            }
        }
        // Expired or corrupt: evict under the write lock, double-checking
        // the entry did not just get replaced.
        let _write = self.guard.write().unwrap();
        if let Some(hit) = read_entry(&image_dir) {
            let age = chrono::Utc::now() - hit.meta.cached_at;
            if age.num_seconds() < LAYER_TTL_SECS {
                return Some(hit);
            }
        }
        let _ = std::fs::remove_dir_all(&image_dir);
        metrics::counter!("image_cache_evictions_total", 1u64);
        None
    }

    /// Reserve space for a new entry, evicting oldest entries when the
    /// cache is at capacity. The admission is rolled back unless finalized.
    pub fn admit(&self, digest: &str) -> Result<Admission, ImageError> {
        let _write = self.guard.write().unwrap();
        self.evict_for_capacity();
        let image_dir = self.root.join(cache_key(digest));
        let layers_dir = image_dir.join("layers");
        std::fs::create_dir_all(&layers_dir)
            .map_err(|e| ImageError::Registry(format!("creating cache entry: {}", e)))?;
        Ok(Admission {
            image_dir,
            layers_dir,
            finalized: false,
        })
    }

    fn evict_for_capacity(&self) {
        let mut entries: Vec<(PathBuf, chrono::DateTime<chrono::Utc>)> = Vec::new();
        let Ok(dir) = std::fs::read_dir(&self.root) else {
            return;
        };
        for entry in dir.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match read_metadata(&path) {
                Some(meta) => entries.push((path, meta.cached_at)),
                // Orphan directory without metadata: reclaim it.
                None => {
                    let _ = std::fs::remove_dir_all(&path);
                }
            }
        }
        if entries.len() >= MAX_CACHED_IMAGES {
            entries.sort_by_key(|(_, at)| *at);
            let excess = entries.len() - MAX_CACHED_IMAGES + 1;
            for (path, _) in entries.into_iter().take(excess) {
                debug!(path = %path.display(), "evicting oldest cached image");
                let _ = std::fs::remove_dir_all(&path);
                metrics::counter!("image_cache_evictions_total", 1u64);
            }
        }
    }

    /// Remove entries past their TTL (and anything unreadable).
    pub fn sweep(&self) {
        let _write = self.guard.write().unwrap();
        let Ok(dir) = std::fs::read_dir(&self.root) else {
            return;
        };
        let now = chrono::Utc::now();
        for entry in dir.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let expired = match read_metadata(&path) {
                Some(meta) => (now - meta.cached_at).num_seconds() >= LAYER_TTL_SECS,
                None => true,
            };
            if expired {
                debug!(path = %path.display(), "sweeping expired cache entry");
                let _ = std::fs::remove_dir_all(&path);
                metrics::counter!("image_cache_evictions_total", 1u64);
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        let _read = self.guard.read().unwrap();
        std::fs::read_dir(&self.root)
            .map(|dir| dir.flatten().filter(|e| e.path().is_dir()).count())
            .unwrap_or(0)
    }
}

/// In-flight admission; dropped without `finalize` it cleans itself up.
pub struct Admission {
    image_dir: PathBuf,
    layers_dir: PathBuf,
    finalized: bool,
}

impl Admission {
    pub fn layer_path(&self, index: usize) -> PathBuf {
        self.layers_dir.join(format!("layer-{}.tar", index))
    }

    pub fn finalize(mut self, meta: &LayerCacheMetadata) -> Result<(), ImageError> {
        let bytes = serde_json::to_vec_pretty(meta)
            .map_err(|e| ImageError::Registry(format!("serializing metadata: {}", e)))?;
        std::fs::write(self.image_dir.join("metadata.json"), bytes)
            .map_err(|e| ImageError::Registry(format!("writing metadata: {}", e)))?;
        self.finalized = true;
        Ok(())
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = std::fs::remove_dir_all(&self.image_dir);
        }
    }
}

fn read_metadata(image_dir: &Path) -> Option<LayerCacheMetadata> {
    let raw = std::fs::read(image_dir.join("metadata.json")).ok()?;
    serde_json::from_slice(&raw).ok()
}

fn read_entry(image_dir: &Path) -> Option<CacheHit> {
    let meta = read_metadata(image_dir)?;
    let layers_dir = image_dir.join("layers");
    let mut layer_paths = Vec::with_capacity(meta.layer_count);
    let mut total_bytes = 0u64;
    for idx in 0..meta.layer_count {
        let path = layers_dir.join(format!("layer-{}.tar", idx));
        let stat = std::fs::metadata(&path).ok()?;
        if !stat.is_file() {
            return None;
        }
        total_bytes += stat.len();
        layer_paths.push(path);
    }
    Some(CacheHit {
        meta,
        layer_paths,
        total_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(digest: &str, layers: usize, age_secs: i64) -> LayerCacheMetadata {
        LayerCacheMetadata {
            image_ref: format!("example.com/app@{}", digest),
            digest: digest.to_string(),
            platform: "linux/amd64".to_string(),
            layer_count: layers,
            cached_at: chrono::Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    fn admit_entry(cache: &LayerCache, digest: &str, layers: usize, age_secs: i64) {
        let admission = cache.admit(digest).unwrap();
        for i in 0..layers {
            std::fs::write(admission.layer_path(i), b"tar-bytes").unwrap();
        }
        admission.finalize(&meta(digest, layers, age_secs)).unwrap();
    }

    #[test]
    fn admit_then_lookup_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path().join("cache"));
        admit_entry(&cache, "sha256:aaa", 2, 0);

        let hit = cache.lookup("sha256:aaa").expect("cache hit");
        assert_eq!(hit.meta.layer_count, 2);
        assert_eq!(hit.layer_paths.len(), 2);
        assert!(hit.layer_paths.iter().all(|p| p.exists()));
        assert_eq!(hit.total_bytes, 18);
    }

    #[test]
    fn missing_layer_file_evicts_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path().join("cache"));
        admit_entry(&cache, "sha256:bbb", 2, 0);
        let victim = cache.root().join(cache_key("sha256:bbb")).join("layers/layer-1.tar");
        std::fs::remove_file(victim).unwrap();

        assert!(cache.lookup("sha256:bbb").is_none());
        assert!(!cache.root().join(cache_key("sha256:bbb")).exists());
    }

    #[test]
    fn expired_entry_is_a_miss_and_swept() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path().join("cache"));
        admit_entry(&cache, "sha256:ccc", 1, LAYER_TTL_SECS + 5);
        assert!(cache.lookup("sha256:ccc").is_none());

        admit_entry(&cache, "sha256:ddd", 1, LAYER_TTL_SECS + 5);
        cache.sweep();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn admission_at_capacity_evicts_the_single_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path().join("cache"));
        for (i, age) in [50i64, 40, 30, 20, 10].iter().enumerate() {
            admit_entry(&cache, &format!("sha256:e{}", i), 1, *age);
        }
        assert_eq!(cache.entry_count(), MAX_CACHED_IMAGES);

        // Sixth admission pushes out sha256:e0 (oldest) only.
        admit_entry(&cache, "sha256:new", 1, 0);
        assert_eq!(cache.entry_count(), MAX_CACHED_IMAGES);
        assert!(cache.lookup("sha256:e0").is_none());
        assert!(cache.lookup("sha256:e1").is_some());
        assert!(cache.lookup("sha256:new").is_some());
    }

    #[test]
    fn startup_purges_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        std::fs::create_dir_all(root.join("stale-entry")).unwrap();
        let cache = LayerCache::new(root);
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn abandoned_admission_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path().join("cache"));
        {
            let admission = cache.admit("sha256:partial").unwrap();
            std::fs::write(admission.layer_path(0), b"half").unwrap();
        }
        assert_eq!(cache.entry_count(), 0);
        assert!(cache.lookup("sha256:partial").is_none());
    }
}
