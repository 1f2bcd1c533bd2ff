//! Topology derivation: a pure graph build over the mirror plus a debounced
//! rebuild loop that publishes snapshots per subscription.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use vantage_cache::TypedCache;
use vantage_core::{Topology, ViewMode};
use vantage_events::{EventBus, SubKey};

mod build;

pub use build::build_topology;

fn debounce_window() -> Duration {
    let ms = std::env::var("VANTAGE_DEBOUNCE_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(200);
    Duration::from_millis(ms)
}

#[derive(Default)]
struct SubState {
    refs: usize,
    generation: u64,
}

/// Per-projection reference counts and generation counters. Lives in the
/// process (not in the per-context service) so long-lived streams keep
/// receiving snapshots across context switches, and generations stay
/// monotone per subscription.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subs: Mutex<FxHashMap<SubKey, SubState>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a projection live; rebuilds publish to the bus while any
    /// subscriber holds it.
    pub fn retain(&self, key: &SubKey) {
        let mut subs = self.subs.lock().unwrap();
        subs.entry(key.clone()).or_default().refs += 1;
    }

    pub fn release(&self, key: &SubKey) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(state) = subs.get_mut(key) {
            state.refs = state.refs.saturating_sub(1);
            if state.refs == 0 && state.generation == 0 {
                subs.remove(key);
            }
        }
    }

    fn bump_generation(&self, key: &SubKey) -> u64 {
        let mut subs = self.subs.lock().unwrap();
        let state = subs.entry(key.clone()).or_default();
        state.generation += 1;
        state.generation
    }

    fn active_keys(&self) -> Vec<SubKey> {
        self.subs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| s.refs > 0)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Drives graph rebuilds for one mirror generation. Rebuilds are debounced
/// after an invalidation and run one at a time, so a burst of watch deltas
/// costs one build per subscription.
pub struct TopologyService {
    cache: Arc<TypedCache>,
    bus: Arc<EventBus>,
    subs: Arc<SubscriptionRegistry>,
}

impl TopologyService {
    pub fn new(
        cache: Arc<TypedCache>,
        bus: Arc<EventBus>,
        subs: Arc<SubscriptionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self { cache, bus, subs })
    }

    /// Build the current graph for a projection, bumping its generation.
    pub fn snapshot(&self, view: ViewMode, namespace: Option<&str>) -> Topology {
        let key = SubKey {
            view,
            namespace: namespace.map(|s| s.to_string()),
        };
        let generation = self.subs.bump_generation(&key);
        let state = self.cache.export();
        let started = std::time::Instant::now();
        let topo = build_topology(&state, view, namespace, generation);
        metrics::histogram!(
            "topology_build_ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
        topo
    }

    /// Consume cache invalidations until the sender closes. Waits out the
    /// debounce window after the first signal, swallowing the burst, then
    /// rebuilds every live projection.
    pub fn start(self: &Arc<Self>, mut invalidations: mpsc::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let window = debounce_window();
            loop {
                if invalidations.recv().await.is_none() {
                    break;
                }
                // Swallow the burst, but only up to the window: constant
                // churn must not postpone rebuilds forever.
                let deadline = tokio::time::Instant::now() + window;
                loop {
                    match tokio::time::timeout_at(deadline, invalidations.recv()).await {
                        Ok(Some(_)) => continue,
                        Ok(None) => {
                            info!("invalidation channel closed; topology loop exiting");
                            return;
                        }
                        Err(_) => break,
                    }
                }
                service.rebuild_all();
            }
            info!("invalidation channel closed; topology loop exiting");
        })
    }

    /// One build per live projection, published under its own topic key.
    pub fn rebuild_all(&self) {
        for key in self.subs.active_keys() {
            let topo = self.snapshot(key.view, key.namespace.as_deref());
            debug!(
                view = ?key.view,
                ns = %key.namespace.as_deref().unwrap_or("(all)"),
                nodes = topo.nodes.len(),
                edges = topo.edges.len(),
                generation = topo.generation,
                "topology rebuilt"
            );
            match serde_json::to_value(&topo) {
                Ok(payload) => self.bus.publish_topology(&key, payload),
                Err(e) => debug!(error = %e, "topology serialization failed"),
            }
        }
    }
}
