//! Watch-based cluster mirror. One long-lived watcher per kind keeps a
//! copy-on-write index that readers load without locking; every observed
//! mutation is forwarded on a bounded delta channel for the history and
//! topology layers to consume.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vantage_core::{ChangeOp, ResourceRef, Uid};
use vantage_kubehub::ClientHub;

pub mod dynamic;
mod watch;

pub use dynamic::DynamicCache;

/// The closed set of kinds the typed mirror watches.
pub const TYPED_KINDS: &[&str] = &[
    "apps/v1/Deployment",
    "apps/v1/StatefulSet",
    "apps/v1/DaemonSet",
    "apps/v1/ReplicaSet",
    "v1/Pod",
    "batch/v1/Job",
    "batch/v1/CronJob",
    "v1/Service",
    "networking.k8s.io/v1/Ingress",
    "v1/ConfigMap",
    "v1/Secret",
    "v1/PersistentVolumeClaim",
    "autoscaling/v2/HorizontalPodAutoscaler",
    "v1/Node",
    "v1/Namespace",
    "v1/Event",
];

/// One observed mutation, with the cached versions around it.
#[derive(Debug, Clone)]
pub struct CacheDelta {
    pub kind: String,
    pub op: ChangeOp,
    pub before: Option<Arc<Value>>,
    pub after: Option<Arc<Value>>,
}

pub type ObjectKey = (Option<String>, String);

/// Immutable per-kind index snapshot. Writers build a new one and swap the
/// pointer; readers clone `Arc`s out of the current one.
#[derive(Default)]
pub struct KindIndex {
    pub objects: FxHashMap<ObjectKey, Arc<Value>>,
    pub by_uid: FxHashMap<Uid, ResourceRef>,
}

pub(crate) type SharedIndex = Arc<ArcSwap<KindIndex>>;

pub struct TypedCache {
    indices: FxHashMap<String, SharedIndex>,
    available: Vec<String>,
    skipped: Vec<String>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TypedCache {
    /// Prime and start one watcher per mirrorable kind. Resolves only after
    /// every watcher has completed its initial list, or fails when any
    /// primer errors fatally. Every subsequent delta goes out on `delta_tx`.
    pub async fn start(
        hub: Arc<ClientHub>,
        delta_tx: mpsc::Sender<CacheDelta>,
    ) -> Result<Arc<TypedCache>> {
        let cancel = CancellationToken::new();
        let mut indices = FxHashMap::default();
        let mut tasks = Vec::new();
        let mut primers = Vec::new();
        let mut available = Vec::new();
        let mut skipped = Vec::new();

        let discovered = hub.kinds();
        for gvk_key in TYPED_KINDS {
            let desc = discovered.iter().find(|d| d.gvk_key() == *gvk_key);
            match desc {
                Some(d) if d.listable() && d.watchable() => {
                    let swap: SharedIndex = Arc::new(ArcSwap::from_pointee(KindIndex::default()));
                    indices.insert(d.kind.clone(), Arc::clone(&swap));
                    available.push(d.kind.clone());
                    let (primed_tx, primed_rx) = oneshot::channel::<Result<usize>>();
                    primers.push((d.kind.clone(), primed_rx));
                    tasks.push(tokio::spawn(watch::run_kind_watcher(
                        Arc::clone(&hub),
                        d.clone(),
                        swap,
                        delta_tx.clone(),
                        cancel.clone(),
                        Some(primed_tx),
                    )));
                }
                Some(d) => {
                    warn!(kind = %d.kind, verbs = ?d.verbs, "kind not listable+watchable; skipping");
                    skipped.push(d.kind.clone());
                }
                None => {
                    warn!(gvk = %gvk_key, "kind not served by this cluster; skipping");
                    skipped.push(gvk_key.to_string());
                }
            }
        }
        if available.is_empty() {
            bail!("no mirrorable kinds discovered; is discovery complete?");
        }

        for (kind, primed_rx) in primers {
            let primed = primed_rx
                .await
                .context("watcher exited before priming")
                .and_then(|r| r.with_context(|| format!("initial sync failed for {}", kind)));
            match primed {
                Ok(count) => info!(kind = %kind, objects = count, "initial sync complete"),
                Err(e) => {
                    // One fatal primer takes the whole mirror down.
                    cancel.cancel();
                    return Err(e);
                }
            }
        }

        available.sort();
        Ok(Arc::new(TypedCache {
            indices,
            available,
            skipped,
            cancel,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn available_kinds(&self) -> &[String] {
        &self.available
    }

    pub fn skipped_kinds(&self) -> &[String] {
        &self.skipped
    }

    pub fn has_kind(&self, kind: &str) -> bool {
        self.indices.contains_key(kind)
    }

    /// Current index snapshot for a kind.
    pub fn index(&self, kind: &str) -> Option<Arc<KindIndex>> {
        self.indices.get(kind).map(|s| s.load_full())
    }

    pub fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Arc<Value>> {
        let idx = self.index(kind)?;
        idx.objects
            .get(&(namespace.map(|s| s.to_string()), name.to_string()))
            .cloned()
    }

    pub fn resolve_uid(&self, kind: &str, uid: &Uid) -> Option<ResourceRef> {
        self.index(kind)?.by_uid.get(uid).cloned()
    }

    /// All objects of a kind, optionally filtered to one namespace.
    pub fn list(&self, kind: &str, namespace: Option<&str>) -> Vec<Arc<Value>> {
        match self.index(kind) {
            Some(idx) => idx
                .objects
                .iter()
                .filter(|((ns, _), _)| match namespace {
                    Some(want) => ns.as_deref() == Some(want),
                    None => true,
                })
                .map(|(_, v)| Arc::clone(v))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Point-in-time view over every kind: cheap Arc clones of the current
    /// index snapshots.
    pub fn export(&self) -> Vec<(String, Arc<KindIndex>)> {
        let mut out: Vec<(String, Arc<KindIndex>)> = self
            .indices
            .iter()
            .map(|(k, s)| (k.clone(), s.load_full()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Object counts per kind, for the health endpoint.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.indices
            .iter()
            .map(|(k, s)| (k.clone(), s.load().objects.len()))
            .collect()
    }

    /// Cancel all watchers and wait for them to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("resource mirror stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(ns: &str, name: &str, uid_byte: u8) -> Arc<Value> {
        Arc::new(json!({
            "metadata": {
                "name": name,
                "namespace": ns,
                "uid": format!("00000000-0000-0000-0000-0000000000{:02x}", uid_byte),
                "resourceVersion": "1",
            }
        }))
    }

    fn cache_with_pods(pods: &[(&str, &str, u8)]) -> TypedCache {
        let mut index = KindIndex::default();
        for (ns, name, b) in pods {
            let obj = pod(ns, name, *b);
            let uid = vantage_core::meta::uid(&obj).unwrap();
            index.objects.insert(
                (Some(ns.to_string()), name.to_string()),
                Arc::clone(&obj),
            );
            index.by_uid.insert(
                uid,
                ResourceRef {
                    kind: "Pod".into(),
                    group: String::new(),
                    version: "v1".into(),
                    namespace: Some(ns.to_string()),
                    name: name.to_string(),
                },
            );
        }
        let mut indices = FxHashMap::default();
        indices.insert(
            "Pod".to_string(),
            Arc::new(ArcSwap::from_pointee(index)) as SharedIndex,
        );
        TypedCache {
            indices,
            available: vec!["Pod".to_string()],
            skipped: Vec::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn list_filters_by_namespace() {
        let cache = cache_with_pods(&[("a", "p1", 1), ("a", "p2", 2), ("b", "p3", 3)]);
        assert_eq!(cache.list("Pod", None).len(), 3);
        assert_eq!(cache.list("Pod", Some("a")).len(), 2);
        assert_eq!(cache.list("Pod", Some("zzz")).len(), 0);
        assert!(cache.list("Service", None).is_empty());
    }

    #[test]
    fn get_and_uid_lookup() {
        let cache = cache_with_pods(&[("a", "p1", 7)]);
        let obj = cache.get("Pod", Some("a"), "p1").expect("hit");
        assert_eq!(vantage_core::meta::name(&obj), "p1");
        assert!(cache.get("Pod", Some("a"), "nope").is_none());

        let uid = vantage_core::meta::uid(&obj).unwrap();
        let re = cache.resolve_uid("Pod", &uid).expect("uid mapped");
        assert_eq!(re.node_id(), "Pod/a/p1");
    }

    #[test]
    fn counts_reflect_index_sizes() {
        let cache = cache_with_pods(&[("a", "p1", 1), ("b", "p2", 2)]);
        assert_eq!(cache.counts().get("Pod"), Some(&2));
    }
}
