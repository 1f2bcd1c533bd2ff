//! Interactive shells: a cluster-side exec stream bridged to channel pairs
//! the WebSocket layer pumps. Resize requests ride a side channel so they
//! never interrupt output.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::SinkExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, TerminalSize};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vantage_kubehub::ClientHub;

use crate::SessionState;

#[derive(Debug)]
pub enum ExecOutput {
    /// Remote stdout/stderr bytes.
    Output(Vec<u8>),
    /// Abnormal termination; terminal frame before close.
    Error(String),
    /// Remote side finished.
    Closed,
}

/// One attached shell. Dropping the session cancels the upstream exec.
pub struct ExecSession {
    pub id: String,
    input_tx: mpsc::Sender<Vec<u8>>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    output_rx: mpsc::Receiver<ExecOutput>,
    cancel: CancellationToken,
}

impl ExecSession {
    pub async fn send_input(&self, data: Vec<u8>) -> bool {
        self.input_tx.send(data).await.is_ok()
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> bool {
        self.resize_tx.send((cols, rows)).await.is_ok()
    }

    pub async fn next_output(&mut self) -> Option<ExecOutput> {
        self.output_rx.recv().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellInfo {
    pub id: String,
    pub namespace: String,
    pub pod: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub state: SessionState,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

struct ShellEntry {
    info: ShellInfo,
    cancel: CancellationToken,
}

/// Registry of live shells. Context switches and shutdown close everything
/// through here.
pub struct ShellManager {
    hub: Arc<ClientHub>,
    sessions: Mutex<HashMap<String, ShellEntry>>,
}

impl ShellManager {
    pub fn new(hub: Arc<ClientHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn list(&self) -> Vec<ShellInfo> {
        let mut out: Vec<ShellInfo> = self
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|e| e.info.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn close_all(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (_, entry) in sessions.drain() {
            entry.cancel.cancel();
        }
    }

    /// Attach to a pod and return the bridged session. The command defaults
    /// to a login shell probe (`/bin/sh`).
    pub async fn open(
        self: &Arc<Self>,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecSession> {
        let api: Api<Pod> = Api::namespaced(self.hub.client(), namespace);
        let mut ap = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(false)
            .tty(true);
        if let Some(c) = container {
            ap = ap.container(c);
        }
        let command = if command.is_empty() {
            vec!["/bin/sh".to_string()]
        } else {
            command
        };
        let mut attached = api
            .exec(pod, command, &ap)
            .await
            .with_context(|| format!("attaching to {}/{}", namespace, pod))?;

        let id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
        let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(8);
        let (output_tx, output_rx) = mpsc::channel::<ExecOutput>(64);

        {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(
                id.clone(),
                ShellEntry {
                    info: ShellInfo {
                        id: id.clone(),
                        namespace: namespace.to_string(),
                        pod: pod.to_string(),
                        container: container.map(|s| s.to_string()),
                        state: SessionState::Active,
                        created_at: chrono::Utc::now(),
                    },
                    cancel: cancel.clone(),
                },
            );
        }
        metrics::counter!("shell_sessions_total", 1u64);
        info!(session = %id, ns = %namespace, pod = %pod, "shell session opened");

        let manager = Arc::clone(self);
        let session_id = id.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stdin_writer = attached.stdin();
            let mut size_tx = attached.terminal_size();
            let (pump_tx, mut pump_rx) = mpsc::channel::<Vec<u8>>(64);

            let mut readers = Vec::new();
            if let Some(mut stdout) = attached.stdout() {
                let tx = pump_tx.clone();
                readers.push(tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match stdout.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tx.send(buf[..n].to_vec()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }));
            }
            drop(pump_tx);

            let mut failed: Option<String> = None;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    input = input_rx.recv() => {
                        match input {
                            Some(data) => {
                                if let Some(writer) = stdin_writer.as_mut() {
                                    if writer.write_all(&data).await.is_err() {
                                        failed = Some("stdin closed by remote".to_string());
                                        break;
                                    }
                                    let _ = writer.flush().await;
                                }
                            }
                            // Client half-closed; cancel the peer.
                            None => break,
                        }
                    }
                    resize = resize_rx.recv() => {
                        if let Some((cols, rows)) = resize {
                            if let Some(tx) = size_tx.as_mut() {
                                let _ = tx.send(TerminalSize { width: cols, height: rows }).await;
                            }
                        }
                    }
                    output = pump_rx.recv() => {
                        match output {
                            Some(bytes) => {
                                if output_tx.send(ExecOutput::Output(bytes)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }

            for r in readers {
                r.abort();
            }
            if let Some(reason) = failed {
                warn!(session = %session_id, reason = %reason, "shell session failed");
                let _ = output_tx.send(ExecOutput::Error(reason)).await;
            }
            let _ = output_tx.send(ExecOutput::Closed).await;
            manager.finish(&session_id);
            info!(session = %session_id, "shell session closed");
        });

        Ok(ExecSession {
            id,
            input_tx,
            resize_tx,
            output_rx,
            cancel,
        })
    }

    fn finish(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }
}
