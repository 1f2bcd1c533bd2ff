//! Imperative per-workload operations: log tails, interactive shells and
//! port-forwards. Every session owns its cluster-side stream and dies with
//! the client, an explicit close, a context switch or process shutdown.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

pub mod exec;
pub mod forward;
pub mod logs;

pub use exec::{ExecOutput, ExecSession, ShellInfo, ShellManager};
pub use forward::{
    ForwardError, ForwardTarget, PortForwardManager, PortForwardSession, PortInfo,
};
pub use logs::{LogChunk, LogOptions};

/// Session lifecycle. Transitions are monotonic except `Starting -> Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Closing,
    Closed,
    Failed,
}

/// Cancellation handle for an in-flight streaming operation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub(crate) fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

pub(crate) fn ops_queue_cap() -> usize {
    std::env::var("VANTAGE_OPS_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1024)
}
