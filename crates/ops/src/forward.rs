//! Port-forward lifecycle: identifier-keyed sessions, local listener
//! allocation, per-session cancellation. Targets may be pods or services;
//! a service resolves to one ready backing pod at open time.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vantage_cache::TypedCache;
use vantage_core::{meta, nested};
use vantage_kubehub::ClientHub;

use crate::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Establish(String),
}

#[derive(Debug, Clone)]
pub enum ForwardTarget {
    Pod { namespace: String, name: String },
    Service { namespace: String, name: String },
}

impl ForwardTarget {
    fn namespace(&self) -> &str {
        match self {
            ForwardTarget::Pod { namespace, .. } => namespace,
            ForwardTarget::Service { namespace, .. } => namespace,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ForwardTarget::Pod { .. } => "pod",
            ForwardTarget::Service { .. } => "service",
        }
    }

    fn name(&self) -> &str {
        match self {
            ForwardTarget::Pod { name, .. } => name,
            ForwardTarget::Service { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PortForwardSession {
    pub id: String,
    pub target_type: String,
    pub namespace: String,
    pub name: String,
    /// Pod actually carrying the stream (resolved for services).
    pub pod: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub state: SessionState,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    pub protocol: String,
}

struct ForwardEntry {
    session: PortForwardSession,
    cancel: CancellationToken,
}

pub struct PortForwardManager {
    hub: Arc<ClientHub>,
    cache: Arc<TypedCache>,
    // Open/close are serialised through this lock, per session semantics.
    sessions: Mutex<HashMap<String, ForwardEntry>>,
}

impl PortForwardManager {
    pub fn new(hub: Arc<ClientHub>, cache: Arc<TypedCache>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            cache,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub async fn list(&self) -> Vec<PortForwardSession> {
        let mut out: Vec<PortForwardSession> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|e| e.session.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Open a forward. `local_port` 0 (or unset upstream) asks the OS for an
    /// ephemeral port. A second forward for the same pod and remote port is
    /// a conflict.
    pub async fn open(
        self: &Arc<Self>,
        target: ForwardTarget,
        remote_port: u16,
        local_port: u16,
    ) -> Result<PortForwardSession, ForwardError> {
        let pod_name = self.resolve_pod(&target).await?;
        let namespace = target.namespace().to_string();

        let mut sessions = self.sessions.lock().await;
        if sessions
            .values()
            .any(|e| e.session.pod == pod_name && e.session.remote_port == remote_port)
        {
            return Err(ForwardError::Conflict(format!(
                "port-forward already active for {}/{} port {}",
                namespace, pod_name, remote_port
            )));
        }

        let bind_addr =
            std::env::var("VANTAGE_PF_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());
        let listener = TcpListener::bind((bind_addr.as_str(), local_port))
            .await
            .map_err(|e| ForwardError::Establish(format!("binding local port {}: {}", local_port, e)))?;
        let actual_port = listener
            .local_addr()
            .map_err(|e| ForwardError::Establish(e.to_string()))?
            .port();

        // Probe the cluster side before advertising the session, so a bad
        // target fails the open instead of the first connection.
        let api: Api<Pod> = Api::namespaced(self.hub.client(), &namespace);
        let mut probe = api.portforward(&pod_name, &[remote_port]).await.map_err(|e| {
            ForwardError::Establish(format!(
                "establishing forward to {}/{}: {}",
                namespace, pod_name, e
            ))
        })?;
        drop(probe.take_stream(remote_port));

        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let session = PortForwardSession {
            id: id.clone(),
            target_type: target.type_name().to_string(),
            namespace: namespace.clone(),
            name: target.name().to_string(),
            pod: pod_name.clone(),
            remote_port,
            local_port: actual_port,
            state: SessionState::Active,
            created_at: chrono::Utc::now(),
        };
        sessions.insert(
            id.clone(),
            ForwardEntry {
                session: session.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(sessions);
        metrics::counter!("portforward_sessions_total", 1u64);
        info!(session = %id, ns = %namespace, pod = %pod_name, remote = remote_port, local = actual_port, "port-forward open");

        let manager = Arc::clone(self);
        let session_id = id;
        tokio::spawn(async move {
            let failed = accept_loop(api, listener, pod_name, remote_port, cancel).await;
            if let Err(e) = &failed {
                warn!(session = %session_id, error = %e, "port-forward failed");
                manager.mark_failed(&session_id).await;
            }
            manager.remove(&session_id).await;
            info!(session = %session_id, "port-forward closed");
        });

        Ok(session)
    }

    /// Terminate the listener and cluster stream, releasing the local port.
    pub async fn close(&self, id: &str) -> Result<(), ForwardError> {
        let mut sessions = self.sessions.lock().await;
        match sessions.remove(id) {
            Some(entry) => {
                entry.cancel.cancel();
                Ok(())
            }
            None => Err(ForwardError::NotFound(format!(
                "no such port-forward session: {}",
                id
            ))),
        }
    }

    /// Sessions do not survive context switches.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, entry) in sessions.drain() {
            entry.cancel.cancel();
        }
    }

    async fn mark_failed(&self, id: &str) {
        if let Some(entry) = self.sessions.lock().await.get_mut(id) {
            entry.session.state = SessionState::Failed;
        }
    }

    async fn remove(&self, id: &str) {
        self.sessions.lock().await.remove(id);
    }

    /// Pods forward to themselves; services resolve to the first ready pod
    /// matched by their selector.
    async fn resolve_pod(&self, target: &ForwardTarget) -> Result<String, ForwardError> {
        match target {
            ForwardTarget::Pod { name, .. } => Ok(name.clone()),
            ForwardTarget::Service { namespace, name } => {
                let svc = self
                    .cache
                    .get("Service", Some(namespace), name)
                    .ok_or_else(|| {
                        ForwardError::NotFound(format!("service {}/{} not found", namespace, name))
                    })?;
                let selector = nested::field(&svc, &["spec", "selector"])
                    .and_then(|s| s.as_object())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        ForwardError::Establish(format!(
                            "service {}/{} has no selector",
                            namespace, name
                        ))
                    })?;
                let pods = self.cache.list("Pod", Some(namespace));
                let backing = pods.iter().find(|pod| {
                    let running = nested::str_field(pod, &["status", "phase"]) == Some("Running");
                    let labels = nested::field(pod, &["metadata", "labels"])
                        .and_then(|l| l.as_object());
                    running
                        && labels
                            .map(|l| selector.iter().all(|(k, v)| l.get(k) == Some(v)))
                            .unwrap_or(false)
                });
                backing
                    .map(|pod| meta::name(pod).to_string())
                    .ok_or_else(|| {
                        ForwardError::Establish(format!(
                            "no ready pod backs service {}/{}",
                            namespace, name
                        ))
                    })
            }
        }
    }

    /// Candidate ports for the open dialog.
    pub fn available_ports(
        &self,
        target_type: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<PortInfo>, ForwardError> {
        match target_type {
            "pod" => {
                let pod = self
                    .cache
                    .get("Pod", Some(namespace), name)
                    .ok_or_else(|| {
                        ForwardError::NotFound(format!("pod {}/{} not found", namespace, name))
                    })?;
                let mut out = Vec::new();
                if let Some(containers) = nested::array_field(&pod, &["spec", "containers"]) {
                    for container in containers {
                        if let Some(ports) = container.get("ports").and_then(|p| p.as_array()) {
                            for port in ports {
                                if let Some(p) = port.get("containerPort").and_then(|p| p.as_u64()) {
                                    out.push(PortInfo {
                                        name: port.get("name").and_then(|n| n.as_str()).map(String::from),
                                        port: p as u16,
                                        protocol: port
                                            .get("protocol")
                                            .and_then(|p| p.as_str())
                                            .unwrap_or("TCP")
                                            .to_string(),
                                    });
                                }
                            }
                        }
                    }
                }
                Ok(out)
            }
            "service" => {
                let svc = self
                    .cache
                    .get("Service", Some(namespace), name)
                    .ok_or_else(|| {
                        ForwardError::NotFound(format!("service {}/{} not found", namespace, name))
                    })?;
                let mut out = Vec::new();
                if let Some(ports) = nested::array_field(&svc, &["spec", "ports"]) {
                    for port in ports {
                        if let Some(p) = port.get("port").and_then(|p| p.as_u64()) {
                            out.push(PortInfo {
                                name: port.get("name").and_then(|n| n.as_str()).map(String::from),
                                port: p as u16,
                                protocol: port
                                    .get("protocol")
                                    .and_then(|p| p.as_str())
                                    .unwrap_or("TCP")
                                    .to_string(),
                            });
                        }
                    }
                }
                Ok(out)
            }
            other => Err(ForwardError::NotFound(format!(
                "unknown target type: {}",
                other
            ))),
        }
    }
}

/// Accept local connections, opening one cluster stream per connection.
/// Returns `Err` only for failures after establishment.
async fn accept_loop(
    api: Api<Pod>,
    listener: TcpListener,
    pod: String,
    remote_port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (mut inbound, peer) = accepted.context("accepting local connection")?;
                let mut pf = match api.portforward(&pod, &[remote_port]).await {
                    Ok(pf) => pf,
                    Err(e) => return Err(anyhow::anyhow!("forward stream lost: {}", e)),
                };
                let Some(mut stream) = pf.take_stream(remote_port) else {
                    return Err(anyhow::anyhow!(
                        "forward stream missing for port {}",
                        remote_port
                    ));
                };
                let conn_cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = conn_cancel.cancelled() => {}
                        res = tokio::io::copy_bidirectional(&mut inbound, &mut stream) => {
                            if let Err(e) = res {
                                tracing::debug!(peer = %peer, error = %e, "forward connection ended");
                            }
                        }
                    }
                });
            }
        }
    }
}
