//! RBAC capability probing with a short-lived cache. Four sensitive verbs
//! are checked concurrently; any probe failure reads as denial so features
//! fail closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::warn;

use crate::ClientHub;
use vantage_core::Capabilities;

const CAPABILITY_TTL: Duration = Duration::from_secs(60);

/// Probe result plus, for each denied capability, the reason recorded at
/// probe time. The HTTP layer answers capability-gated requests from this
/// without another cluster round-trip.
#[derive(Debug, Clone)]
pub struct CapabilitySnapshot {
    pub caps: Capabilities,
    pub denial_reasons: std::collections::HashMap<&'static str, String>,
}

impl CapabilitySnapshot {
    pub fn denial_reason(&self, capability: &str) -> Option<&str> {
        self.denial_reasons.get(capability).map(|s| s.as_str())
    }
}

struct Cached {
    snapshot: CapabilitySnapshot,
    expires: Instant,
}

pub struct CapabilityProber {
    hub: Arc<ClientHub>,
    cached: RwLock<Option<Cached>>,
}

impl CapabilityProber {
    pub fn new(hub: Arc<ClientHub>) -> Self {
        Self {
            hub,
            cached: RwLock::new(None),
        }
    }

    /// Current capabilities, refreshed at most once per TTL. Read-lock fast
    /// path, write-lock refresh with a second freshness check after
    /// acquisition.
    pub async fn capabilities(&self) -> Result<CapabilitySnapshot> {
        {
            let guard = self.cached.read().await;
            if let Some(c) = guard.as_ref() {
                if Instant::now() < c.expires {
                    return Ok(c.snapshot.clone());
                }
            }
        }
        let mut guard = self.cached.write().await;
        if let Some(c) = guard.as_ref() {
            if Instant::now() < c.expires {
                return Ok(c.snapshot.clone());
            }
        }
        let snapshot = self.probe().await;
        *guard = Some(Cached {
            snapshot: snapshot.clone(),
            expires: Instant::now() + CAPABILITY_TTL,
        });
        Ok(snapshot)
    }

    /// Drop the cached entry; the next call re-probes.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn probe(&self) -> CapabilitySnapshot {
        let (exec, logs, port_forward, secrets) = tokio::join!(
            self.hub.can_i(None, "", "pods", Some("exec"), "create"),
            self.hub.can_i(None, "", "pods", Some("log"), "get"),
            self.hub.can_i(None, "", "pods", Some("portforward"), "create"),
            self.hub.can_i(None, "", "secrets", None, "list"),
        );
        let mut denial_reasons = std::collections::HashMap::new();
        let mut settle = |name: &'static str, res: Result<bool>| -> bool {
            match res {
                Ok(true) => true,
                Ok(false) => {
                    denial_reasons.insert(name, "denied by cluster RBAC".to_string());
                    false
                }
                Err(e) => {
                    warn!(capability = name, error = %e, "capability probe failed; treating as denied");
                    denial_reasons.insert(name, e.to_string());
                    false
                }
            }
        };
        let caps = Capabilities {
            exec: settle("exec", exec),
            logs: settle("logs", logs),
            port_forward: settle("portForward", port_forward),
            secrets: settle("secrets", secrets),
        };
        metrics::counter!("capability_probe_total", 1u64);
        CapabilitySnapshot {
            caps,
            denial_reasons,
        }
    }
}
