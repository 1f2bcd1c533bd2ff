//! Streaming endpoints: the event-stream fan-out, log tails and the
//! WebSocket shell bridge.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use base64::Engine as _;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use vantage_core::ViewMode;
use vantage_events::SubKey;
use vantage_ops::{ExecOutput, LogOptions};
use vantage_topology::SubscriptionRegistry;

use crate::{error::ApiError, non_empty, AppState};

#[derive(Deserialize)]
pub(crate) struct StreamParams {
    namespace: Option<String>,
    view: Option<String>,
}

/// Releases the projection when the client stream is dropped.
struct RetainGuard {
    subs: Arc<SubscriptionRegistry>,
    key: SubKey,
}

impl Drop for RetainGuard {
    fn drop(&mut self) {
        self.subs.release(&self.key);
    }
}

/// Long-lived event stream: an immediate topology snapshot, then bus frames
/// (topology, change, raw_event, context_progress/context_changed,
/// heartbeat) until the client goes away.
pub(crate) async fn events_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let view: ViewMode = params
        .view
        .unwrap_or_default()
        .parse()
        .map_err(ApiError::BadRequest)?;
    let namespace = non_empty(params.namespace);
    let key = SubKey {
        view,
        namespace: namespace.clone(),
    };

    let mut subscription = state.bus.subscribe(key.clone());
    state.topology_subs.retain(&key);
    let guard = RetainGuard {
        subs: Arc::clone(&state.topology_subs),
        key: key.clone(),
    };
    let initial = {
        let mirror = state.mirror.read().await;
        mirror.topology.snapshot(view, namespace.as_deref())
    };
    info!(view = ?view, ns = %namespace.as_deref().unwrap_or("(all)"), "event stream subscribed");

    let stream = async_stream::stream! {
        let _guard = guard;
        if let Ok(event) = Event::default().event("topology").json_data(&initial) {
            yield Ok(event);
        }
        while let Some(frame) = subscription.recv().await {
            match Event::default().event(frame.event).json_data(&*frame.payload) {
                Ok(event) => yield Ok(event),
                Err(e) => debug!(error = %e, "unserializable frame skipped"),
            }
        }
    };
    Ok(Sse::new(stream))
}

#[derive(Deserialize)]
pub(crate) struct LogParamsQuery {
    container: Option<String>,
    tail: Option<i64>,
    previous: Option<bool>,
    timestamps: Option<bool>,
}

async fn checked_log_options(
    state: &AppState,
    namespace: &str,
    name: &str,
    params: LogParamsQuery,
    follow: bool,
) -> Result<LogOptions, ApiError> {
    state.require_capability("logs").await?;
    let mirror = state.mirror.read().await;
    let pod = mirror
        .cache
        .get("Pod", Some(namespace), name)
        .ok_or_else(|| ApiError::NotFound(format!("pod {}/{} not found", namespace, name)))?;
    let container = vantage_ops::logs::resolve_container(&pod, params.container.as_deref())
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(LogOptions {
        container,
        tail_lines: params.tail,
        previous: params.previous.unwrap_or(false),
        timestamps: params.timestamps.unwrap_or(false),
        follow,
    })
}

/// Non-follow capture: one JSON envelope with the whole buffer.
pub(crate) async fn pod_logs(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<LogParamsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let opts = checked_log_options(&state, &namespace, &name, params, false).await?;
    let logs = vantage_ops::logs::collect_logs(&state.hub, &namespace, &name, opts)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "pod": name, "namespace": namespace, "logs": logs })))
}

/// Follow stream: `log` frames until the pod stream ends or the client
/// disconnects; dropping the response cancels the cluster-side stream.
pub(crate) async fn pod_logs_stream(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<LogParamsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let opts = checked_log_options(&state, &namespace, &name, params, true).await?;
    let context_cancel = {
        let mirror = state.mirror.read().await;
        mirror.session_cancel.clone()
    };
    let mut handle = vantage_ops::logs::stream_logs(&state.hub, &namespace, &name, opts)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let stream = async_stream::stream! {
        loop {
            tokio::select! {
                // A context switch kills follow streams along with the
                // rest of the old context's sessions.
                _ = context_cancel.cancelled() => break,
                chunk = handle.rx.recv() => {
                    match chunk {
                        Some(chunk) => {
                            if let Ok(event) = Event::default()
                                .event("log")
                                .json_data(&json!({ "data": chunk.data }))
                            {
                                yield Ok(event);
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        if let Ok(event) = Event::default().event("eof").json_data(&json!({})) {
            yield Ok(event);
        }
        // handle (and its cancel) drops here, closing the upstream.
    };
    Ok(Sse::new(stream))
}

#[derive(Deserialize)]
pub(crate) struct ExecParams {
    container: Option<String>,
    shell: Option<String>,
}

/// WebSocket shell. Client frames: `{type: "input", data: base64}` and
/// `{type: "resize", cols, rows}`. Server frames: `{type: "output", data:
/// base64}` and a terminal `{type: "error", data}` on abnormal end.
pub(crate) async fn pod_exec(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ExecParams>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    state.ensure_writable()?;
    state.require_capability("exec").await?;
    {
        let mirror = state.mirror.read().await;
        if mirror.cache.get("Pod", Some(&namespace), &name).is_none() {
            return Err(ApiError::NotFound(format!(
                "pod {}/{} not found",
                namespace, name
            )));
        }
    }
    Ok(ws.on_upgrade(move |socket| run_shell(socket, state, namespace, name, params)))
}

async fn run_shell(
    mut socket: WebSocket,
    state: AppState,
    namespace: String,
    name: String,
    params: ExecParams,
) {
    let command = params
        .shell
        .map(|sh| vec![sh])
        .unwrap_or_else(|| vec!["/bin/sh".to_string()]);
    let shells = {
        let mirror = state.mirror.read().await;
        Arc::clone(&mirror.shells)
    };
    let mut session = match shells
        .open(&namespace, &name, params.container.as_deref(), command)
        .await
    {
        Ok(s) => s,
        Err(e) => {
            warn!(ns = %namespace, pod = %name, error = %e, "exec attach failed");
            let frame = json!({ "type": "error", "data": e.to_string() }).to_string();
            let _ = socket.send(Message::Text(frame)).await;
            let _ = socket.close().await;
            return;
        }
    };
    info!(session = %session.id, ns = %namespace, pod = %name, "shell bridged");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<serde_json::Value>(&text) else {
                            continue;
                        };
                        match frame.get("type").and_then(|t| t.as_str()) {
                            Some("input") => {
                                let data = frame
                                    .get("data")
                                    .and_then(|d| d.as_str())
                                    .and_then(|d| {
                                        base64::engine::general_purpose::STANDARD.decode(d).ok()
                                    });
                                if let Some(bytes) = data {
                                    if !session.send_input(bytes).await {
                                        break;
                                    }
                                }
                            }
                            Some("resize") => {
                                let cols = frame.get("cols").and_then(|c| c.as_u64()).unwrap_or(80);
                                let rows = frame.get("rows").and_then(|r| r.as_u64()).unwrap_or(24);
                                session.resize(cols as u16, rows as u16).await;
                            }
                            other => debug!(frame_type = ?other, "unknown shell frame ignored"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            output = session.next_output() => {
                match output {
                    Some(ExecOutput::Output(bytes)) => {
                        let frame = json!({
                            "type": "output",
                            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                        })
                        .to_string();
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Some(ExecOutput::Error(message)) => {
                        let frame = json!({ "type": "error", "data": message }).to_string();
                        let _ = socket.send(Message::Text(frame)).await;
                        break;
                    }
                    Some(ExecOutput::Closed) | None => break,
                }
            }
        }
    }
    session.close();
    let _ = socket.close().await;
    info!(ns = %namespace, pod = %name, "shell bridge closed");
}
