//! `vantage` binary: flag parsing, bootstrap in dependency order, and
//! shutdown. Bootstrap failures before the mirror is primed are fatal.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use vantage_server::{AppState, Mirror};

#[derive(Parser, Debug)]
#[command(name = "vantage", version, about = "Local-first cluster observability")]
struct Cli {
    /// Path to kubeconfig file (default: in-cluster, then ~/.kube/config)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to start on (default: current-context)
    #[arg(long)]
    context: Option<String>,

    /// Initial namespace filter hint for the UI (empty = all namespaces)
    #[arg(long)]
    namespace: Option<String>,

    /// Server port
    #[arg(long, default_value_t = 9280)]
    port: u16,

    /// Don't announce a browser URL on startup
    #[arg(long = "no-browser")]
    no_browser: bool,

    /// Development mode (frontend served separately)
    #[arg(long)]
    dev: bool,

    /// Reject write operations and session-opening endpoints
    #[arg(long = "read-only")]
    read_only: bool,

    /// Persist change history to ~/.vantage/history.jsonl
    #[arg(long = "persist-history")]
    persist_history: bool,

    /// Maximum number of changes retained in memory
    #[arg(long = "history-limit", default_value_t = 1000)]
    history_limit: usize,
}

fn init_tracing() {
    let env = std::env::var("VANTAGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VANTAGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "prometheus exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VANTAGE_METRICS_ADDR; expected host:port");
        }
    }
}

fn history_path(persist: bool) -> Option<PathBuf> {
    if !persist {
        return None;
    }
    let home = std::env::var_os("HOME").map(PathBuf::from)?;
    Some(home.join(".vantage/history.jsonl"))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "vantage starting");

    let hub = match vantage_kubehub::ClientHub::connect(vantage_kubehub::ConnectOptions {
        kubeconfig: cli.kubeconfig.clone(),
        context: cli.context.clone(),
    })
    .await
    {
        Ok(hub) => hub,
        Err(e) => {
            error!(error = %e, "failed to initialise cluster client");
            std::process::exit(1);
        }
    };

    let history = match vantage_history::ChangeHistory::new(
        cli.history_limit,
        history_path(cli.persist_history),
    ) {
        Ok(h) => Arc::new(h),
        Err(e) => {
            error!(error = %e, "failed to initialise change history");
            std::process::exit(1);
        }
    };

    let bus = vantage_events::EventBus::new();
    bus.start_heartbeat();
    let topology_subs = vantage_topology::SubscriptionRegistry::new();

    let mirror = match Mirror::start(
        Arc::clone(&hub),
        Arc::clone(&history),
        Arc::clone(&bus),
        Arc::clone(&topology_subs),
    )
    .await
    {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to initialise resource mirror");
            std::process::exit(1);
        }
    };

    let prober = Arc::new(vantage_kubehub::CapabilityProber::new(Arc::clone(&hub)));
    match prober.capabilities().await {
        Ok(snapshot) => info!(
            exec = snapshot.caps.exec,
            logs = snapshot.caps.logs,
            port_forward = snapshot.caps.port_forward,
            secrets = snapshot.caps.secrets,
            "capabilities probed"
        ),
        Err(e) => warn!(error = %e, "capability probe failed at startup"),
    }

    let cache_root = std::env::temp_dir().join("vantage-image-cache");
    let inspector = vantage_image::ImageInspector::new(cache_root, Some(Arc::clone(&hub)));
    let releases = vantage_helm::SecretStorageEngine::new(Arc::clone(&hub));

    let state = AppState {
        hub,
        prober,
        history,
        bus,
        topology_subs,
        mirror: Arc::new(tokio::sync::RwLock::new(mirror)),
        inspector,
        releases,
        read_only: cli.read_only,
        version: env!("CARGO_PKG_VERSION").to_string(),
        started: std::time::Instant::now(),
        switching: Arc::new(tokio::sync::Mutex::new(())),
    };

    if cli.dev {
        info!("development mode: serving API only; run the frontend separately");
    }
    if !cli.no_browser {
        let mut url = format!("http://localhost:{}", cli.port);
        if let Some(ns) = &cli.namespace {
            if !ns.is_empty() {
                url.push_str(&format!("?namespace={}", ns));
            }
        }
        info!(url = %url, "open this URL in a browser");
    }

    let shutdown_state = state.clone();
    let shutdown = async move {
        wait_for_signal().await;
        info!("shutting down");
        {
            let mirror = shutdown_state.mirror.read().await;
            mirror.stop().await;
        }
        shutdown_state.bus.shutdown();
    };

    if let Err(e) = vantage_server::serve(state, cli.port, shutdown).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
