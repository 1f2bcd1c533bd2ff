//! Mirror assembly and context-switch orchestration: wires watch deltas
//! into the history engine, the fan-out bus and the topology rebuild loop,
//! and rebuilds all of it when the operator switches contexts.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use vantage_cache::{CacheDelta, DynamicCache, TypedCache};
use vantage_core::ChangeOp;
use vantage_events::EventBus;
use vantage_history::ChangeHistory;
use vantage_kubehub::ClientHub;
use vantage_ops::{PortForwardManager, ShellManager};
use vantage_topology::{SubscriptionRegistry, TopologyService};

use crate::AppState;

fn delta_cap() -> usize {
    std::env::var("VANTAGE_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2048)
}

/// Everything that is rebuilt per context: the mirrors, the topology loop
/// and the session managers bound to them.
pub struct Mirror {
    pub cache: Arc<TypedCache>,
    pub dynamic: Arc<DynamicCache>,
    pub topology: Arc<TopologyService>,
    pub shells: Arc<ShellManager>,
    pub forwards: Arc<PortForwardManager>,
    /// Parent token for request-scoped streams (log follows) that must die
    /// with this context.
    pub session_cancel: tokio_util::sync::CancellationToken,
    pump: tokio::task::JoinHandle<()>,
    topo_loop: tokio::task::JoinHandle<()>,
}

impl Mirror {
    /// Discover kinds, prime the typed mirror and start the delta pump.
    /// Fatal when the typed mirror cannot prime.
    pub async fn start(
        hub: Arc<ClientHub>,
        history: Arc<ChangeHistory>,
        bus: Arc<EventBus>,
        subs: Arc<SubscriptionRegistry>,
    ) -> Result<Mirror> {
        hub.discover().await.context("initial discovery")?;
        let (delta_tx, delta_rx) = mpsc::channel::<CacheDelta>(delta_cap());
        let cache = TypedCache::start(Arc::clone(&hub), delta_tx.clone())
            .await
            .context("starting resource mirror")?;
        let dynamic = DynamicCache::new(Arc::clone(&hub));
        let eager: Vec<String> = std::env::var("VANTAGE_WATCH_GVKS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if !eager.is_empty() {
            dynamic.start_eager(&eager, delta_tx.clone()).await;
        }
        drop(delta_tx);
        let topology = TopologyService::new(Arc::clone(&cache), Arc::clone(&bus), subs);
        let (invalidate_tx, invalidate_rx) = mpsc::channel::<()>(delta_cap());
        let topo_loop = topology.start(invalidate_rx);
        let pump = spawn_pump(delta_rx, invalidate_tx, Arc::clone(&history), Arc::clone(&bus));
        let shells = ShellManager::new(Arc::clone(&hub));
        let forwards = PortForwardManager::new(Arc::clone(&hub), Arc::clone(&cache));
        info!(kinds = cache.available_kinds().len(), "mirror running");
        Ok(Mirror {
            cache,
            dynamic,
            topology,
            shells,
            forwards,
            session_cancel: tokio_util::sync::CancellationToken::new(),
            pump,
            topo_loop,
        })
    }

    /// Tear down watchers, sessions and the derived loops.
    pub async fn stop(&self) {
        self.session_cancel.cancel();
        self.shells.close_all();
        self.forwards.close_all().await;
        self.cache.stop().await;
        self.dynamic.stop().await;
        // Watchers gone means the delta senders are dropped; the pump and
        // the topology loop would drain and exit on their own, but nothing
        // downstream wants the tail of a dead context.
        self.pump.abort();
        self.topo_loop.abort();
    }
}

/// The single consumer of watch deltas: each one becomes a history record,
/// a change (or raw-event) frame on the bus, and a topology invalidation.
fn spawn_pump(
    mut delta_rx: mpsc::Receiver<CacheDelta>,
    invalidate_tx: mpsc::Sender<()>,
    history: Arc<ChangeHistory>,
    bus: Arc<EventBus>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delta) = delta_rx.recv().await {
            let subject = delta.after.as_deref().or(delta.before.as_deref());
            if delta.kind == "Event" {
                if delta.op != ChangeOp::Delete {
                    if let Some(obj) = subject {
                        let event = vantage_core::ClusterEvent::from_raw(obj);
                        let ns = event.involved_namespace.clone();
                        if let Ok(payload) = serde_json::to_value(&event) {
                            bus.publish_raw_event(ns.as_deref(), payload);
                        }
                    }
                }
            }
            let record = history.record(
                &delta.kind,
                delta.op,
                delta.before.as_deref(),
                delta.after.as_deref(),
            );
            if let Some(record) = record {
                if delta.kind != "Event" {
                    if let Ok(payload) = serde_json::to_value(&record) {
                        bus.publish_change(record.namespace.as_deref(), payload);
                    }
                }
            }
            if delta.kind != "Event" && invalidate_tx.send(()).await.is_err() {
                break;
            }
        }
        info!("delta pump stopped");
    })
}

/// Asynchronous context switch: progress frames while the old mirror dies
/// and the new one primes, topology held back until the prime completes,
/// then a `context_changed` envelope and fresh snapshots.
pub async fn switch_context(state: &AppState, name: &str) -> Result<()> {
    let _switch_guard = state.switching.lock().await;
    if state.hub.context_name() == name {
        info!(context = %name, "already on requested context");
        return Ok(());
    }

    state.bus.pause_topology();
    state
        .bus
        .publish_progress(&format!("switching to context {}", name));

    {
        let mirror = state.mirror.read().await;
        state.bus.publish_progress("closing sessions and watchers");
        mirror.stop().await;
    }

    if let Err(e) = state.hub.switch_context(name).await {
        // The old client still works; revive publication and report.
        state.bus.resume_topology();
        state
            .bus
            .publish_progress(&format!("context switch failed: {}", e));
        return Err(e);
    }
    state.prober.invalidate().await;

    state.bus.publish_progress("discovering resources");
    let next = Mirror::start(
        Arc::clone(&state.hub),
        Arc::clone(&state.history),
        Arc::clone(&state.bus),
        Arc::clone(&state.topology_subs),
    )
    .await;
    let next = match next {
        Ok(m) => m,
        Err(e) => {
            state.bus.resume_topology();
            state
                .bus
                .publish_progress(&format!("mirror rebuild failed: {}", e));
            warn!(error = %e, "mirror rebuild after context switch failed");
            return Err(e);
        }
    };
    state.bus.publish_progress("resource mirror primed");

    {
        let mut mirror = state.mirror.write().await;
        *mirror = next;
    }

    // Order matters for subscribers: the context envelope first, then the
    // gate opens, then fresh snapshots. No stale frame can slip in between.
    state.bus.publish_context_changed(name);
    state.bus.resume_topology();
    state.mirror.read().await.topology.rebuild_all();
    info!(context = %name, "context switch complete");
    Ok(())
}
