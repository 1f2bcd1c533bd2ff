//! Discovery-driven cache for kinds outside the typed set (mostly custom
//! resources). A curated set can be mirrored eagerly; everything else is
//! served on demand through a bounded, TTL-bounded memo.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vantage_core::meta;
use vantage_kubehub::ClientHub;

use crate::{watch, CacheDelta, KindIndex, SharedIndex};

const MEMO_CAPACITY: usize = 64;
const MEMO_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct MemoEntry {
    items: Arc<Vec<Arc<Value>>>,
    fetched: Instant,
}

pub struct DynamicCache {
    hub: Arc<ClientHub>,
    // Eagerly watched custom kinds, by singular kind name.
    watched: RwLock<FxHashMap<String, SharedIndex>>,
    memo: RwLock<FxHashMap<String, MemoEntry>>,
    memo_order: Mutex<VecDeque<String>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DynamicCache {
    pub fn new(hub: Arc<ClientHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            watched: RwLock::new(FxHashMap::default()),
            memo: RwLock::new(FxHashMap::default()),
            memo_order: Mutex::new(VecDeque::new()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start eager watchers for a curated set of GVK keys. Unknown or
    /// unlistable kinds are skipped with a warning; this path is never
    /// fatal.
    pub async fn start_eager(
        self: &Arc<Self>,
        gvk_keys: &[String],
        delta_tx: mpsc::Sender<CacheDelta>,
    ) {
        let discovered = self.hub.kinds();
        for key in gvk_keys {
            let Some(desc) = discovered.iter().find(|d| &d.gvk_key() == key) else {
                warn!(gvk = %key, "curated kind not served; skipping");
                continue;
            };
            if !desc.listable() || !desc.watchable() {
                warn!(gvk = %key, verbs = ?desc.verbs, "curated kind not mirrorable; skipping");
                continue;
            }
            let swap: SharedIndex = Arc::new(ArcSwap::from_pointee(KindIndex::default()));
            self.watched
                .write()
                .await
                .insert(desc.kind.clone(), Arc::clone(&swap));
            let task = tokio::spawn(watch::run_kind_watcher(
                Arc::clone(&self.hub),
                desc.clone(),
                swap,
                delta_tx.clone(),
                self.cancel.clone(),
                None,
            ));
            self.tasks.lock().await.push(task);
            info!(gvk = %key, "eager dynamic watcher started");
        }
    }

    /// Fetch one object by kind name, hitting an eager mirror first, then
    /// the live API.
    pub async fn get_dynamic(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Arc<Value>> {
        if let Some(swap) = self.watched.read().await.get(kind) {
            let idx = swap.load_full();
            if let Some(hit) = idx
                .objects
                .get(&(namespace.map(|s| s.to_string()), name.to_string()))
            {
                return Ok(Arc::clone(hit));
            }
        }
        let desc = self
            .hub
            .descriptor_for_kind(kind)
            .ok_or_else(|| anyhow!("kind not served: {}", kind))?;
        let api = self.hub.dynamic_api(&desc.gvk_key(), namespace).await?;
        let obj = tokio::time::timeout(Duration::from_secs(30), api.get(name))
            .await
            .context("get timed out")?
            .with_context(|| format!("getting {}/{}", kind, name))?;
        let mut v = serde_json::to_value(&obj)?;
        meta::strip_managed_fields(&mut v);
        Ok(Arc::new(v))
    }

    /// List a kind, memoised behind a small LRU so bursts of identical
    /// requests hit the cluster once.
    pub async fn list_dynamic(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Arc<Vec<Arc<Value>>>> {
        if let Some(swap) = self.watched.read().await.get(kind) {
            let idx = swap.load_full();
            let items: Vec<Arc<Value>> = idx
                .objects
                .iter()
                .filter(|((ns, _), _)| match namespace {
                    Some(want) => ns.as_deref() == Some(want),
                    None => true,
                })
                .map(|(_, v)| Arc::clone(v))
                .collect();
            return Ok(Arc::new(items));
        }

        let memo_key = format!("{}|{}", kind, namespace.unwrap_or(""));
        {
            let memo = self.memo.read().await;
            if let Some(entry) = memo.get(&memo_key) {
                if entry.fetched.elapsed() < MEMO_TTL {
                    return Ok(Arc::clone(&entry.items));
                }
            }
        }
        let mut memo = self.memo.write().await;
        if let Some(entry) = memo.get(&memo_key) {
            if entry.fetched.elapsed() < MEMO_TTL {
                return Ok(Arc::clone(&entry.items));
            }
        }

        let desc = self
            .hub
            .descriptor_for_kind(kind)
            .ok_or_else(|| anyhow!("kind not served: {}", kind))?;
        if !desc.listable() {
            return Err(anyhow!("kind {} does not support list", kind));
        }
        let api = self.hub.dynamic_api(&desc.gvk_key(), namespace).await?;
        let list = tokio::time::timeout(
            Duration::from_secs(30),
            api.list(&kube::api::ListParams::default()),
        )
        .await
        .context("list timed out")?
        .with_context(|| format!("listing {}", kind))?;
        let items: Vec<Arc<Value>> = list
            .items
            .into_iter()
            .filter_map(|o| {
                let mut v = serde_json::to_value(&o).ok()?;
                meta::strip_managed_fields(&mut v);
                Some(Arc::new(v))
            })
            .collect();
        let items = Arc::new(items);

        let mut order = self.memo_order.lock().await;
        if !memo.contains_key(&memo_key) {
            if order.len() >= MEMO_CAPACITY {
                if let Some(evicted) = order.pop_front() {
                    memo.remove(&evicted);
                    metrics::counter!("dynamic_memo_evictions_total", 1u64);
                }
            }
            order.push_back(memo_key.clone());
        }
        memo.insert(
            memo_key,
            MemoEntry {
                items: Arc::clone(&items),
                fetched: Instant::now(),
            },
        );
        Ok(items)
    }

    /// Drop memoised listings; called on context switch before rediscovery.
    pub async fn invalidate(&self) {
        self.memo.write().await.clear();
        self.memo_order.lock().await.clear();
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        self.watched.write().await.clear();
        self.invalidate().await;
    }
}
