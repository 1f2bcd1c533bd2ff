//! HTTP surface: request routing under `/api`, JSON envelopes, streaming
//! endpoints over the fan-out bus, and capability-gated session endpoints.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use vantage_events::EventBus;
use vantage_helm::ReleaseEngine;
use vantage_history::ChangeHistory;
use vantage_image::ImageInspector;
use vantage_kubehub::{CapabilityProber, ClientHub};
use vantage_topology::SubscriptionRegistry;

pub mod error;
pub mod runtime;

mod handlers;
mod helm;
mod images;
mod portforward;
mod stream;

pub use error::ApiError;
pub use runtime::{switch_context, Mirror};

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ClientHub>,
    pub prober: Arc<CapabilityProber>,
    pub history: Arc<ChangeHistory>,
    pub bus: Arc<EventBus>,
    pub topology_subs: Arc<SubscriptionRegistry>,
    /// Swapped wholesale on context switch.
    pub mirror: Arc<RwLock<Mirror>>,
    pub inspector: Arc<ImageInspector>,
    pub releases: Arc<dyn ReleaseEngine>,
    pub read_only: bool,
    pub version: String,
    pub started: Instant,
    pub switching: Arc<Mutex<()>>,
}

impl AppState {
    /// Gate an endpoint on a probed capability. Denials answer locally with
    /// 503 and never touch the cluster.
    pub async fn require_capability(&self, capability: &'static str) -> Result<(), ApiError> {
        let snapshot = self
            .prober
            .capabilities()
            .await
            .map_err(|e| ApiError::NotReady(e.to_string()))?;
        let allowed = match capability {
            "exec" => snapshot.caps.exec,
            "logs" => snapshot.caps.logs,
            "portForward" => snapshot.caps.port_forward,
            "secrets" => snapshot.caps.secrets,
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(ApiError::CapabilityDenied {
                capability: capability.to_string(),
            })
        }
    }

    pub fn ensure_writable(&self) -> Result<(), ApiError> {
        if self.read_only {
            Err(ApiError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/cluster-info", get(handlers::cluster_info))
        .route("/api/capabilities", get(handlers::capabilities))
        .route("/api/api-resources", get(handlers::api_resources))
        .route("/api/namespaces", get(handlers::namespaces))
        .route("/api/contexts", get(handlers::contexts))
        .route("/api/context", post(handlers::switch_context_handler))
        .route("/api/topology", get(handlers::topology))
        .route("/api/events", get(handlers::events))
        .route("/api/events/stream", get(stream::events_stream))
        .route("/api/changes", get(handlers::changes))
        .route("/api/resources/:kind", get(handlers::list_resources))
        .route(
            "/api/resources/:kind/:namespace/:name",
            get(handlers::get_resource)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource),
        )
        .route("/api/pods/:namespace/:name/logs", get(stream::pod_logs))
        .route(
            "/api/pods/:namespace/:name/logs/stream",
            get(stream::pod_logs_stream),
        )
        .route("/api/pods/:namespace/:name/exec", get(stream::pod_exec))
        .route(
            "/api/portforwards",
            get(portforward::list).post(portforward::open),
        )
        .route("/api/portforwards/:id", delete(portforward::close))
        .route(
            "/api/portforwards/available/:target_type/:namespace/:name",
            get(portforward::available),
        )
        .route("/api/helm/releases", get(helm::list_releases))
        .route(
            "/api/helm/releases/:namespace/:name",
            get(helm::get_release).delete(helm::uninstall),
        )
        .route(
            "/api/helm/releases/:namespace/:name/history",
            get(helm::history),
        )
        .route(
            "/api/helm/releases/:namespace/:name/manifest",
            get(helm::manifest),
        )
        .route(
            "/api/helm/releases/:namespace/:name/values",
            get(helm::values),
        )
        .route("/api/helm/releases/:namespace/:name/diff", get(helm::diff))
        .route(
            "/api/helm/releases/:namespace/:name/upgrade-info",
            get(helm::upgrade_info),
        )
        .route(
            "/api/helm/releases/:namespace/:name/rollback",
            post(helm::rollback),
        )
        .route(
            "/api/helm/releases/:namespace/:name/upgrade",
            post(helm::upgrade),
        )
        .route("/api/helm/upgrade-check", get(helm::upgrade_check))
        .route("/api/images/metadata", get(images::metadata))
        .route("/api/images/inspect", get(images::inspect))
        .route("/api/images/file", get(images::file))
        .with_state(state)
}

/// Serve until the process is told to stop.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let app = router(state);
    info!(addr = %addr, "http server listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Shared unset-aware empty-string handling for query params: the UI sends
/// `namespace=` for "all namespaces".
pub(crate) fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}
