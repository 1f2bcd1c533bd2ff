//! Port-forward endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use vantage_ops::{ForwardError, ForwardTarget};

use crate::{error::ApiError, AppState};

impl From<ForwardError> for ApiError {
    fn from(e: ForwardError) -> Self {
        match e {
            ForwardError::NotFound(m) => ApiError::NotFound(m),
            ForwardError::Conflict(m) => ApiError::Conflict(m),
            ForwardError::Establish(m) => ApiError::Internal(m),
        }
    }
}

pub(crate) async fn list(State(state): State<AppState>) -> Json<Value> {
    let mirror = state.mirror.read().await;
    let sessions = mirror.forwards.list().await;
    Json(json!({ "portforwards": sessions }))
}

#[derive(Deserialize)]
pub(crate) struct OpenRequest {
    #[serde(rename = "type", default = "default_target_type")]
    target_type: String,
    namespace: String,
    name: String,
    #[serde(rename = "remotePort")]
    remote_port: u16,
    #[serde(rename = "localPort", default)]
    local_port: u16,
}

fn default_target_type() -> String {
    "pod".to_string()
}

pub(crate) async fn open(
    State(state): State<AppState>,
    Json(req): Json<OpenRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.ensure_writable()?;
    state.require_capability("portForward").await?;
    let target = match req.target_type.as_str() {
        "pod" => ForwardTarget::Pod {
            namespace: req.namespace,
            name: req.name,
        },
        "service" => ForwardTarget::Service {
            namespace: req.namespace,
            name: req.name,
        },
        other => {
            return Err(ApiError::BadRequest(format!(
                "unknown target type: {}",
                other
            )))
        }
    };
    let mirror = state.mirror.read().await;
    let session = mirror
        .forwards
        .open(target, req.remote_port, req.local_port)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "portforward": session }))))
}

pub(crate) async fn close(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_writable()?;
    let mirror = state.mirror.read().await;
    mirror.forwards.close(&id).await?;
    Ok(Json(json!({ "closed": id })))
}

pub(crate) async fn available(
    State(state): State<AppState>,
    Path((target_type, namespace, name)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    state.require_capability("portForward").await?;
    let mirror = state.mirror.read().await;
    let ports = mirror
        .forwards
        .available_ports(&target_type, &namespace, &name)?;
    Ok(Json(json!({ "ports": ports })))
}
