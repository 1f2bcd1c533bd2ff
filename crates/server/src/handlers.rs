//! JSON request handlers: cluster metadata, the mirror views, change
//! history and raw resource access.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use vantage_core::{meta, ClusterEvent, KindDescriptor, ViewMode};
use vantage_history::HistoryQuery;

use crate::{error::ApiError, non_empty, AppState};

pub(crate) async fn health(State(state): State<AppState>) -> Json<Value> {
    let mirror = state.mirror.read().await;
    Json(json!({
        "status": "ok",
        "version": state.version,
        "uptimeSeconds": state.started.elapsed().as_secs(),
        "context": state.hub.context_name(),
        "resourceCounts": mirror.cache.counts(),
        "skippedKinds": mirror.cache.skipped_kinds(),
        "historyRecords": state.history.len(),
        "subscribers": state.bus.subscriber_count(),
        "droppedFrames": state.bus.total_drops(),
    }))
}

pub(crate) async fn cluster_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "context": state.hub.context_name(),
        "server": state.hub.server_url(),
        "platform": state.hub.platform_flavour(),
        "credentialSource": state.hub.credential_source(),
        "readOnly": state.read_only,
    }))
}

pub(crate) async fn capabilities(
    State(state): State<AppState>,
) -> Result<Json<vantage_core::Capabilities>, ApiError> {
    let snapshot = state
        .prober
        .capabilities()
        .await
        .map_err(|e| ApiError::NotReady(e.to_string()))?;
    Ok(Json(snapshot.caps))
}

pub(crate) async fn api_resources(State(state): State<AppState>) -> Json<Value> {
    let kinds: Vec<KindDescriptor> = state
        .hub
        .kinds()
        .iter()
        .filter(|d| d.listable())
        .cloned()
        .collect();
    Json(json!({ "resources": kinds, "count": kinds.len() }))
}

pub(crate) async fn namespaces(State(state): State<AppState>) -> Json<Value> {
    let mirror = state.mirror.read().await;
    let mut names: Vec<String> = mirror
        .cache
        .list("Namespace", None)
        .iter()
        .map(|ns| meta::name(ns.as_ref()).to_string())
        .collect();
    names.sort();
    Json(json!({ "namespaces": names }))
}

pub(crate) async fn contexts(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "current": state.hub.context_name(),
        "contexts": state.hub.available_contexts(),
    }))
}

#[derive(Deserialize)]
pub(crate) struct SwitchRequest {
    context: String,
}

/// Kick off an asynchronous context switch; progress is observable on the
/// event stream.
pub(crate) async fn switch_context_handler(
    State(state): State<AppState>,
    Json(req): Json<SwitchRequest>,
) -> Result<(axum::http::StatusCode, Json<Value>), ApiError> {
    state.ensure_writable()?;
    if req.context.is_empty() {
        return Err(ApiError::BadRequest("context must not be empty".into()));
    }
    if !state.hub.available_contexts().contains(&req.context) {
        return Err(ApiError::NotFound(format!(
            "context {:?} not in kubeconfig",
            req.context
        )));
    }
    let switch_state = state.clone();
    let target = req.context.clone();
    tokio::spawn(async move {
        if let Err(e) = crate::runtime::switch_context(&switch_state, &target).await {
            warn!(context = %target, error = %e, "context switch failed");
        }
    });
    info!(context = %req.context, "context switch requested");
    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(json!({ "switching": req.context })),
    ))
}

#[derive(Deserialize)]
pub(crate) struct TopologyParams {
    namespace: Option<String>,
    view: Option<String>,
}

pub(crate) async fn topology(
    State(state): State<AppState>,
    Query(params): Query<TopologyParams>,
) -> Result<Json<vantage_core::Topology>, ApiError> {
    let view: ViewMode = params
        .view
        .unwrap_or_default()
        .parse()
        .map_err(ApiError::BadRequest)?;
    let namespace = non_empty(params.namespace);
    let mirror = state.mirror.read().await;
    Ok(Json(mirror.topology.snapshot(view, namespace.as_deref())))
}

#[derive(Deserialize)]
pub(crate) struct EventsParams {
    namespace: Option<String>,
    limit: Option<usize>,
}

pub(crate) async fn events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Json<Value> {
    let namespace = non_empty(params.namespace);
    let limit = params.limit.unwrap_or(100);
    let mirror = state.mirror.read().await;
    let mut events: Vec<ClusterEvent> = mirror
        .cache
        .list("Event", namespace.as_deref())
        .iter()
        .map(|e| ClusterEvent::from_raw(e.as_ref()))
        .collect();
    events.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
    events.truncate(limit);
    Json(json!({ "events": events }))
}

#[derive(Deserialize)]
pub(crate) struct ChangesParams {
    since: Option<u64>,
    until: Option<u64>,
    namespace: Option<String>,
    kind: Option<String>,
    include_routine: Option<bool>,
    include_raw_events: Option<bool>,
    limit: Option<usize>,
}

pub(crate) async fn changes(
    State(state): State<AppState>,
    Query(params): Query<ChangesParams>,
) -> Json<Value> {
    let query = HistoryQuery {
        since: params.since,
        until: params.until,
        namespace: non_empty(params.namespace),
        kind: non_empty(params.kind),
        include_routine: params.include_routine.unwrap_or(false),
        include_raw_events: params.include_raw_events.unwrap_or(false),
        limit: params.limit,
    };
    let records = state.history.query(&query);
    Json(json!({
        "changes": records,
        "latestId": state.history.latest_id(),
    }))
}

/// Resolve a path kind segment against discovery: the singular capitalised
/// name or the plural resource name both work.
fn resolve_kind(state: &AppState, kind: &str) -> Result<KindDescriptor, ApiError> {
    let kinds = state.hub.kinds();
    kinds
        .iter()
        .find(|d| d.kind == kind)
        .or_else(|| {
            let lower = kind.to_ascii_lowercase();
            kinds.iter().find(|d| d.plural == lower)
        })
        .cloned()
        .ok_or_else(|| ApiError::NotFound(format!("kind not served: {}", kind)))
}

#[derive(Deserialize)]
pub(crate) struct ListParams {
    namespace: Option<String>,
}

pub(crate) async fn list_resources(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let desc = resolve_kind(&state, &kind)?;
    let namespace = non_empty(params.namespace);
    let mirror = state.mirror.read().await;
    let items: Vec<Value> = if mirror.cache.has_kind(&desc.kind) {
        mirror
            .cache
            .list(&desc.kind, namespace.as_deref())
            .iter()
            .map(|v| (**v).clone())
            .collect()
    } else {
        mirror
            .dynamic
            .list_dynamic(&desc.kind, namespace.as_deref())
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .iter()
            .map(|v| (**v).clone())
            .collect()
    };
    Ok(Json(json!({ "kind": desc.kind, "count": items.len(), "items": items })))
}

pub(crate) async fn get_resource(
    State(state): State<AppState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let desc = resolve_kind(&state, &kind)?;
    let ns = if desc.namespaced {
        Some(namespace.as_str())
    } else {
        None
    };
    let mirror = state.mirror.read().await;
    let object: Value = if mirror.cache.has_kind(&desc.kind) {
        mirror
            .cache
            .get(&desc.kind, ns, &name)
            .map(|v| (*v).clone())
            .ok_or_else(|| {
                ApiError::NotFound(format!("{} {}/{} not found", desc.kind, namespace, name))
            })?
    } else {
        (*mirror
            .dynamic
            .get_dynamic(&desc.kind, ns, &name)
            .await
            .map_err(|e| ApiError::NotFound(e.to_string()))?)
        .clone()
    };

    // Controller chain upwards, resolved against the mirror.
    let mut owner_chain: Vec<Value> = Vec::new();
    let mut cursor = object.clone();
    for _ in 0..5 {
        let Some(owner) = meta::controller_owner(&cursor) else {
            break;
        };
        owner_chain.push(json!({ "kind": owner.kind, "name": owner.name }));
        match mirror.cache.get(&owner.kind, ns, &owner.name) {
            Some(parent) => cursor = (*parent).clone(),
            None => break,
        }
    }

    Ok(Json(json!({ "object": object, "ownerChain": owner_chain })))
}

pub(crate) async fn update_resource(
    State(state): State<AppState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    state.ensure_writable()?;
    let desc = resolve_kind(&state, &kind)?;
    let parsed: Value = serde_yaml::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid yaml: {}", e)))?;
    if meta::name(&parsed) != name {
        return Err(ApiError::BadRequest(format!(
            "body names {:?}, path names {:?}",
            meta::name(&parsed),
            name
        )));
    }
    let obj: kube::core::DynamicObject = serde_json::from_value(parsed)
        .map_err(|e| ApiError::BadRequest(format!("not a resource object: {}", e)))?;
    let ns = if desc.namespaced {
        Some(namespace.as_str())
    } else {
        None
    };
    let api = state
        .hub
        .dynamic_api(&desc.gvk_key(), ns)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let updated = api
        .replace(&name, &kube::api::PostParams::default(), &obj)
        .await?;
    info!(kind = %desc.kind, ns = %namespace, name = %name, "resource updated");
    Ok(Json(serde_json::to_value(&updated).unwrap_or(Value::Null)))
}

pub(crate) async fn delete_resource(
    State(state): State<AppState>,
    Path((kind, namespace, name)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_writable()?;
    let desc = resolve_kind(&state, &kind)?;
    let ns = if desc.namespaced {
        Some(namespace.as_str())
    } else {
        None
    };
    let api = state
        .hub
        .dynamic_api(&desc.gvk_key(), ns)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    api.delete(&name, &kube::api::DeleteParams::default())
        .await?;
    info!(kind = %desc.kind, ns = %namespace, name = %name, "resource deleted");
    Ok(Json(json!({ "deleted": format!("{}/{}/{}", desc.kind, namespace, name) })))
}
