//! Per-kind watcher: list-then-watch with reconnect backoff, periodic
//! relist, and copy-on-write index application.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    core::DynamicObject,
    runtime::watcher::{self, Event},
};
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vantage_core::{meta, ChangeOp, KindDescriptor, ResourceRef};
use vantage_kubehub::ClientHub;

use crate::{CacheDelta, KindIndex, SharedIndex};

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

pub(crate) async fn run_kind_watcher(
    hub: Arc<ClientHub>,
    desc: KindDescriptor,
    swap: SharedIndex,
    delta_tx: mpsc::Sender<CacheDelta>,
    cancel: CancellationToken,
    primed: Option<oneshot::Sender<Result<usize>>>,
) {
    let gvk_key = desc.gvk_key();
    let api = match hub.dynamic_api(&gvk_key, None).await {
        Ok(api) => api,
        Err(e) => {
            if let Some(tx) = primed {
                let _ = tx.send(Err(e));
            }
            return;
        }
    };

    // Prime from a paginated list so start() can block on a complete mirror.
    match prime(&api, &desc, &swap, &delta_tx).await {
        Ok(count) => {
            if let Some(tx) = primed {
                let _ = tx.send(Ok(count));
            }
        }
        Err(e) => {
            if let Some(tx) = primed {
                let _ = tx.send(Err(e));
            }
            return;
        }
    }

    let relist_secs = env_u64("VANTAGE_RELIST_SECS", 300);
    let backoff_max = env_u64("VANTAGE_WATCH_BACKOFF_MAX_SECS", 30);
    let mut backoff: u64 = 1;

    info!(gvk = %gvk_key, relist_secs, "watcher starting");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        let relist_timer = tokio::time::sleep(Duration::from_secs(relist_secs));
        tokio::pin!(relist_timer);

        // Read the stream until it errors/ends (true) or the relist timer
        // forces a restart (false).
        let errored = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(gvk = %gvk_key, "watcher cancelled");
                    return;
                }
                maybe_ev = stream.try_next() => {
                    match maybe_ev {
                        Ok(Some(Event::Applied(o))) => {
                            if !apply_applied(&desc, &swap, &o, &delta_tx).await {
                                return;
                            }
                        }
                        Ok(Some(Event::Deleted(o))) => {
                            if !apply_deleted(&desc, &swap, &o, &delta_tx).await {
                                return;
                            }
                        }
                        Ok(Some(Event::Restarted(list))) => {
                            debug!(gvk = %gvk_key, count = list.len(), "watch restarted");
                            if !reconcile(&desc, &swap, &list, &delta_tx).await {
                                return;
                            }
                        }
                        Ok(None) => break true,
                        Err(e) => {
                            warn!(gvk = %gvk_key, error = %e, "watch stream error; will restart");
                            metrics::counter!("watch_errors_total", 1u64);
                            break true;
                        }
                    }
                }
                _ = &mut relist_timer => {
                    debug!(gvk = %gvk_key, "periodic relist; restarting watch");
                    metrics::counter!("relist_total", 1u64);
                    break false;
                }
            }
        };

        if errored {
            let dur = Duration::from_secs(backoff.min(backoff_max));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(dur) => {}
            }
            backoff = (backoff * 2).min(backoff_max).max(1);
        } else {
            backoff = 1;
        }
        metrics::counter!("watch_restarts_total", 1u64);
    }
}

async fn prime(
    api: &Api<DynamicObject>,
    desc: &KindDescriptor,
    swap: &SharedIndex,
    delta_tx: &mpsc::Sender<CacheDelta>,
) -> Result<usize> {
    let page_limit: u32 = env_u64("VANTAGE_SNAPSHOT_PAGE_LIMIT", 500) as u32;
    let mut continue_token: Option<String> = None;
    let mut objects = Vec::new();
    loop {
        let mut params = ListParams::default().limit(page_limit);
        if let Some(ref token) = continue_token {
            params = params.continue_token(token);
        }
        let list = tokio::time::timeout(Duration::from_secs(30), api.list(&params))
            .await
            .context("initial list timed out")?
            .with_context(|| format!("listing {}", desc.gvk_key()))?;
        continue_token = list.metadata.continue_.clone();
        objects.extend(list.items);
        if continue_token.as_deref().map(str::is_empty).unwrap_or(true) {
            break;
        }
        tokio::task::yield_now().await;
    }
    let count = objects.len();
    reconcile(desc, swap, &objects, delta_tx).await;
    Ok(count)
}

/// Normalise a watched object into the cached representation.
fn sanitize(desc: &KindDescriptor, obj: &DynamicObject) -> Option<Value> {
    let mut v = serde_json::to_value(obj).ok()?;
    // List items may omit type metadata; keep cached objects self-describing.
    if v.get("kind").and_then(|k| k.as_str()).unwrap_or("").is_empty() {
        v["kind"] = Value::String(desc.kind.clone());
        let api_version = if desc.group.is_empty() {
            desc.version.clone()
        } else {
            format!("{}/{}", desc.group, desc.version)
        };
        v["apiVersion"] = Value::String(api_version);
    }
    meta::strip_managed_fields(&mut v);
    if desc.kind == "Secret" {
        // Metadata-only mirror for secrets.
        if let Some(obj) = v.as_object_mut() {
            obj.remove("data");
            obj.remove("stringData");
        }
    }
    if meta::uid(&v).is_none() {
        warn!(gvk = %desc.gvk_key(), name = %meta::name(&v), "object missing metadata.uid; skipped");
        return None;
    }
    Some(v)
}

fn resource_ref(desc: &KindDescriptor, v: &Value) -> ResourceRef {
    ResourceRef {
        kind: desc.kind.clone(),
        group: desc.group.clone(),
        version: desc.version.clone(),
        namespace: meta::namespace(v).map(|s| s.to_string()),
        name: meta::name(v).to_string(),
    }
}

/// Insert or replace one object. Returns false when the delta channel is
/// closed and the watcher should exit.
async fn apply_applied(
    desc: &KindDescriptor,
    swap: &SharedIndex,
    obj: &DynamicObject,
    delta_tx: &mpsc::Sender<CacheDelta>,
) -> bool {
    let v = match sanitize(desc, obj) {
        Some(v) => v,
        None => return true,
    };
    let key = (
        meta::namespace(&v).map(|s| s.to_string()),
        meta::name(&v).to_string(),
    );
    let current = swap.load();
    let before = current.objects.get(&key).cloned();
    if let Some(prev) = &before {
        // Relists replay unchanged objects; only a new resourceVersion is a
        // real mutation.
        if meta::resource_version(prev) == meta::resource_version(&v) {
            return true;
        }
    }
    let uid = meta::uid(&v).expect("sanitize checked uid");
    let after = Arc::new(v);
    let mut objects = current.objects.clone();
    let mut by_uid = current.by_uid.clone();
    objects.insert(key, Arc::clone(&after));
    by_uid.insert(uid, resource_ref(desc, &after));
    swap.store(Arc::new(KindIndex { objects, by_uid }));

    let op = if before.is_some() {
        ChangeOp::Update
    } else {
        ChangeOp::Add
    };
    delta_tx
        .send(CacheDelta {
            kind: desc.kind.clone(),
            op,
            before,
            after: Some(after),
        })
        .await
        .is_ok()
}

async fn apply_deleted(
    desc: &KindDescriptor,
    swap: &SharedIndex,
    obj: &DynamicObject,
    delta_tx: &mpsc::Sender<CacheDelta>,
) -> bool {
    let v = match sanitize(desc, obj) {
        Some(v) => v,
        None => return true,
    };
    let key = (
        meta::namespace(&v).map(|s| s.to_string()),
        meta::name(&v).to_string(),
    );
    let current = swap.load();
    let before = match current.objects.get(&key) {
        Some(b) => Arc::clone(b),
        // Never mirrored (or already reconciled away): nothing to observe.
        None => return true,
    };
    let mut objects = current.objects.clone();
    let mut by_uid = current.by_uid.clone();
    objects.remove(&key);
    if let Some(uid) = meta::uid(&before) {
        by_uid.remove(&uid);
    }
    swap.store(Arc::new(KindIndex { objects, by_uid }));

    delta_tx
        .send(CacheDelta {
            kind: desc.kind.clone(),
            op: ChangeOp::Delete,
            before: Some(before),
            after: None,
        })
        .await
        .is_ok()
}

/// Bring the index in line with a full listing: objects missing from the
/// listing are observed as deletions exactly once, changed objects as
/// updates, new ones as adds.
async fn reconcile(
    desc: &KindDescriptor,
    swap: &SharedIndex,
    list: &[DynamicObject],
    delta_tx: &mpsc::Sender<CacheDelta>,
) -> bool {
    let mut listed_keys: FxHashSet<(Option<String>, String)> = FxHashSet::default();
    let mut sanitized = Vec::with_capacity(list.len());
    for obj in list {
        if let Some(v) = sanitize(desc, obj) {
            listed_keys.insert((
                meta::namespace(&v).map(|s| s.to_string()),
                meta::name(&v).to_string(),
            ));
            sanitized.push(v);
        }
    }

    let vanished: Vec<Arc<Value>> = {
        let current = swap.load();
        current
            .objects
            .iter()
            .filter(|(key, _)| !listed_keys.contains(*key))
            .map(|(_, v)| Arc::clone(v))
            .collect()
    };
    for gone in vanished {
        let key = (
            meta::namespace(&gone).map(|s| s.to_string()),
            meta::name(&gone).to_string(),
        );
        let current = swap.load();
        if !current.objects.contains_key(&key) {
            continue;
        }
        let mut objects = current.objects.clone();
        let mut by_uid = current.by_uid.clone();
        objects.remove(&key);
        if let Some(uid) = meta::uid(&gone) {
            by_uid.remove(&uid);
        }
        swap.store(Arc::new(KindIndex { objects, by_uid }));
        let ok = delta_tx
            .send(CacheDelta {
                kind: desc.kind.clone(),
                op: ChangeOp::Delete,
                before: Some(gone),
                after: None,
            })
            .await
            .is_ok();
        if !ok {
            return false;
        }
    }

    for v in sanitized {
        let key = (
            meta::namespace(&v).map(|s| s.to_string()),
            meta::name(&v).to_string(),
        );
        let current = swap.load();
        let before = current.objects.get(&key).cloned();
        if let Some(prev) = &before {
            if meta::resource_version(prev) == meta::resource_version(&v) {
                continue;
            }
        }
        let uid = meta::uid(&v).expect("sanitize checked uid");
        let after = Arc::new(v);
        let mut objects = current.objects.clone();
        let mut by_uid = current.by_uid.clone();
        objects.insert(key, Arc::clone(&after));
        by_uid.insert(uid, resource_ref(desc, &after));
        swap.store(Arc::new(KindIndex { objects, by_uid }));
        let op = if before.is_some() {
            ChangeOp::Update
        } else {
            ChangeOp::Add
        };
        let ok = delta_tx
            .send(CacheDelta {
                kind: desc.kind.clone(),
                op,
                before,
                after: Some(after),
            })
            .await
            .is_ok();
        if !ok {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_swap::ArcSwap;
    use serde_json::json;

    fn desc() -> KindDescriptor {
        KindDescriptor {
            group: String::new(),
            version: "v1".into(),
            kind: "Pod".into(),
            plural: "pods".into(),
            namespaced: true,
            verbs: vec!["list".into(), "watch".into()],
            is_custom: false,
        }
    }

    fn dyn_obj(name: &str, rv: &str, uid_byte: u8) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "uid": format!("00000000-0000-0000-0000-0000000000{:02x}", uid_byte),
                "resourceVersion": rv,
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn applied_emits_add_then_update_and_skips_same_rv() {
        let swap: SharedIndex = Arc::new(ArcSwap::from_pointee(KindIndex::default()));
        let (tx, mut rx) = mpsc::channel(16);
        let d = desc();

        assert!(apply_applied(&d, &swap, &dyn_obj("web", "1", 1), &tx).await);
        assert!(apply_applied(&d, &swap, &dyn_obj("web", "1", 1), &tx).await);
        assert!(apply_applied(&d, &swap, &dyn_obj("web", "2", 1), &tx).await);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.op, ChangeOp::Add);
        assert!(first.before.is_none());
        let second = rx.try_recv().unwrap();
        assert_eq!(second.op, ChangeOp::Update);
        assert_eq!(
            meta::resource_version(second.before.as_ref().unwrap()),
            "1"
        );
        assert!(rx.try_recv().is_err(), "same-rv replay must not emit");
        assert_eq!(swap.load().objects.len(), 1);
        assert_eq!(swap.load().by_uid.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_synthesizes_deletes_for_vanished_objects() {
        let swap: SharedIndex = Arc::new(ArcSwap::from_pointee(KindIndex::default()));
        let (tx, mut rx) = mpsc::channel(16);
        let d = desc();

        assert!(reconcile(&d, &swap, &[dyn_obj("a", "1", 1), dyn_obj("b", "1", 2)], &tx).await);
        while rx.try_recv().is_ok() {}

        // "b" is gone from the next listing, "a" unchanged.
        assert!(reconcile(&d, &swap, &[dyn_obj("a", "1", 1)], &tx).await);
        let delta = rx.try_recv().unwrap();
        assert_eq!(delta.op, ChangeOp::Delete);
        assert_eq!(meta::name(delta.before.as_ref().unwrap()), "b");
        assert!(rx.try_recv().is_err());
        assert_eq!(swap.load().objects.len(), 1);
    }

    #[tokio::test]
    async fn deleted_unknown_object_is_silent() {
        let swap: SharedIndex = Arc::new(ArcSwap::from_pointee(KindIndex::default()));
        let (tx, mut rx) = mpsc::channel(4);
        assert!(apply_deleted(&desc(), &swap, &dyn_obj("ghost", "9", 9), &tx).await);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn secret_data_is_stripped() {
        let d = KindDescriptor {
            kind: "Secret".into(),
            plural: "secrets".into(),
            ..desc()
        };
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": "s", "namespace": "default",
                "uid": "00000000-0000-0000-0000-000000000001", "resourceVersion": "1"},
            "data": {"password": "aHVudGVyMg=="}
        }))
        .unwrap();
        let v = sanitize(&d, &obj).unwrap();
        assert!(v.get("data").is_none());
        assert_eq!(meta::name(&v), "s");
    }
}
