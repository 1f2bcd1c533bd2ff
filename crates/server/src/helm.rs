//! Release-operation endpoints, thin over the engine seam. Everything is
//! gated on the secrets capability (the storage engine reads Helm's
//! release secrets); mutations additionally require write mode.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::{error::ApiError, non_empty, AppState};

#[derive(Deserialize)]
pub(crate) struct NamespaceParam {
    namespace: Option<String>,
}

pub(crate) async fn list_releases(
    State(state): State<AppState>,
    Query(params): Query<NamespaceParam>,
) -> Result<Json<Value>, ApiError> {
    state.require_capability("secrets").await?;
    let namespace = non_empty(params.namespace);
    let releases = state.releases.list(namespace.as_deref()).await?;
    Ok(Json(json!({ "releases": releases })))
}

pub(crate) async fn get_release(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    state.require_capability("secrets").await?;
    let detail = state.releases.get(&namespace, &name).await?;
    Ok(Json(serde_json::to_value(detail).unwrap_or(Value::Null)))
}

pub(crate) async fn history(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    state.require_capability("secrets").await?;
    let revisions = state.releases.history(&namespace, &name).await?;
    Ok(Json(json!({ "history": revisions })))
}

#[derive(Deserialize)]
pub(crate) struct ManifestParams {
    revision: Option<i64>,
}

pub(crate) async fn manifest(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ManifestParams>,
) -> Result<([(&'static str, &'static str); 1], String), ApiError> {
    state.require_capability("secrets").await?;
    let manifest = state
        .releases
        .manifest(&namespace, &name, params.revision)
        .await?;
    Ok(([("content-type", "text/plain; charset=utf-8")], manifest))
}

#[derive(Deserialize)]
pub(crate) struct ValuesParams {
    all: Option<bool>,
}

pub(crate) async fn values(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ValuesParams>,
) -> Result<Json<Value>, ApiError> {
    state.require_capability("secrets").await?;
    let values = state
        .releases
        .values(&namespace, &name, params.all.unwrap_or(false))
        .await?;
    Ok(Json(serde_json::to_value(values).unwrap_or(Value::Null)))
}

#[derive(Deserialize)]
pub(crate) struct DiffParams {
    revision1: i64,
    revision2: i64,
}

pub(crate) async fn diff(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<DiffParams>,
) -> Result<Json<Value>, ApiError> {
    state.require_capability("secrets").await?;
    let diff = state
        .releases
        .diff(&namespace, &name, params.revision1, params.revision2)
        .await?;
    Ok(Json(serde_json::to_value(diff).unwrap_or(Value::Null)))
}

pub(crate) async fn upgrade_info(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    state.require_capability("secrets").await?;
    let info = state.releases.upgrade_check(&namespace, &name).await?;
    Ok(Json(serde_json::to_value(info).unwrap_or(Value::Null)))
}

/// Batch variant over every release visible in scope.
pub(crate) async fn upgrade_check(
    State(state): State<AppState>,
    Query(params): Query<NamespaceParam>,
) -> Result<Json<Value>, ApiError> {
    state.require_capability("secrets").await?;
    let namespace = non_empty(params.namespace);
    let releases = state.releases.list(namespace.as_deref()).await?;
    let mut out = serde_json::Map::new();
    for release in releases {
        let key = format!("{}/{}", release.namespace, release.name);
        match state
            .releases
            .upgrade_check(&release.namespace, &release.name)
            .await
        {
            Ok(info) => {
                out.insert(key, serde_json::to_value(info).unwrap_or(Value::Null));
            }
            Err(e) => {
                out.insert(key, json!({ "error": e.to_string() }));
            }
        }
    }
    Ok(Json(json!({ "releases": out })))
}

#[derive(Deserialize)]
pub(crate) struct RollbackRequest {
    revision: i64,
}

pub(crate) async fn rollback(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<RollbackRequest>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_writable()?;
    state.require_capability("secrets").await?;
    state
        .releases
        .rollback(&namespace, &name, req.revision)
        .await?;
    info!(ns = %namespace, release = %name, revision = req.revision, "rollback requested");
    Ok(Json(json!({ "status": "rolled back", "revision": req.revision })))
}

#[derive(Deserialize)]
pub(crate) struct UpgradeRequest {
    chart: String,
}

pub(crate) async fn upgrade(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(req): Json<UpgradeRequest>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_writable()?;
    state.require_capability("secrets").await?;
    state.releases.upgrade(&namespace, &name, &req.chart).await?;
    Ok(Json(json!({ "status": "upgraded" })))
}

pub(crate) async fn uninstall(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_writable()?;
    state.require_capability("secrets").await?;
    state.releases.uninstall(&namespace, &name).await?;
    info!(ns = %namespace, release = %name, "uninstall requested");
    Ok(Json(json!({ "status": "uninstalled" })))
}
