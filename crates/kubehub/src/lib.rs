//! Cluster client facade: credential resolution, context switching, kind
//! discovery and the per-GVK `ApiResource` cache every other subsystem
//! resolves handles through.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arc_swap::ArcSwap;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Config,
};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::info;

use vantage_core::KindDescriptor;

pub mod capabilities;

pub use capabilities::{CapabilityProber, CapabilitySnapshot};

/// How the process found its credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    InCluster,
    ExplicitFile,
    DefaultFile,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Explicit kubeconfig path; overridden by the in-cluster token when one
    /// is mounted.
    pub kubeconfig: Option<PathBuf>,
    /// Context to select from the kubeconfig; None means current-context.
    pub context: Option<String>,
}

struct HubState {
    client: Client,
    context: String,
    server_url: String,
    source: CredentialSource,
    kubeconfig_path: Option<PathBuf>,
}

/// Shared handle to the active cluster connection. Cheap to clone; context
/// switches swap the inner state so in-flight holders keep the old client
/// until they re-resolve.
pub struct ClientHub {
    state: ArcSwap<HubState>,
    // GVK key -> (ApiResource, namespaced); cleared on context switch.
    resources: RwLock<FxHashMap<String, (ApiResource, bool)>>,
    kinds: ArcSwap<Vec<KindDescriptor>>,
}

impl ClientHub {
    /// Resolve credentials and connect. Order: in-cluster service account,
    /// then an explicit kubeconfig, then the default kubeconfig location.
    pub async fn connect(opts: ConnectOptions) -> Result<Arc<Self>> {
        let state = Self::resolve(&opts).await?;
        info!(
            context = %state.context,
            server = %state.server_url,
            source = ?state.source,
            "cluster client ready"
        );
        Ok(Arc::new(Self {
            state: ArcSwap::from_pointee(state),
            resources: RwLock::new(FxHashMap::default()),
            kinds: ArcSwap::from_pointee(Vec::new()),
        }))
    }

    async fn resolve(opts: &ConnectOptions) -> Result<HubState> {
        if std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
            let config = Config::incluster().context("loading in-cluster config")?;
            let server_url = config.cluster_url.to_string();
            let client = Client::try_from(config).context("building in-cluster client")?;
            return Ok(HubState {
                client,
                context: "in-cluster".to_string(),
                server_url,
                source: CredentialSource::InCluster,
                kubeconfig_path: None,
            });
        }

        let (kubeconfig, path, source) = match &opts.kubeconfig {
            Some(path) => (
                Kubeconfig::read_from(path)
                    .with_context(|| format!("reading kubeconfig at {}", path.display()))?,
                Some(path.clone()),
                CredentialSource::ExplicitFile,
            ),
            None => (
                Kubeconfig::read().context("reading default kubeconfig")?,
                None,
                CredentialSource::DefaultFile,
            ),
        };

        let context = opts
            .context
            .clone()
            .or_else(|| kubeconfig.current_context.clone())
            .ok_or_else(|| anyhow!("kubeconfig has no current context"))?;
        let config = Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(context.clone()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("loading context {:?}", context))?;
        let server_url = config.cluster_url.to_string();
        let client = Client::try_from(config).context("building client from kubeconfig")?;
        Ok(HubState {
            client,
            context,
            server_url,
            source,
            kubeconfig_path: path,
        })
    }

    pub fn client(&self) -> Client {
        self.state.load().client.clone()
    }

    pub fn context_name(&self) -> String {
        self.state.load().context.clone()
    }

    pub fn server_url(&self) -> String {
        self.state.load().server_url.clone()
    }

    pub fn credential_source(&self) -> CredentialSource {
        self.state.load().source
    }

    /// Context names available in the kubeconfig (empty when in-cluster).
    pub fn available_contexts(&self) -> Vec<String> {
        let state = self.state.load();
        let kc = match &state.kubeconfig_path {
            Some(path) => Kubeconfig::read_from(path).ok(),
            None if state.source == CredentialSource::DefaultFile => Kubeconfig::read().ok(),
            None => None,
        };
        kc.map(|kc| kc.contexts.into_iter().map(|c| c.name).collect())
            .unwrap_or_default()
    }

    /// Rebuild the client against another kubeconfig context and drop every
    /// per-context cache. The caller owns tearing down and re-priming the
    /// mirrors around this call.
    pub async fn switch_context(&self, name: &str) -> Result<()> {
        let current = self.state.load();
        if current.source == CredentialSource::InCluster {
            bail!("running with the in-cluster credential; contexts are not switchable");
        }
        let kubeconfig = match &current.kubeconfig_path {
            Some(path) => Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig at {}", path.display()))?,
            None => Kubeconfig::read().context("reading default kubeconfig")?,
        };
        if !kubeconfig.contexts.iter().any(|c| c.name == name) {
            bail!("context {:?} not found in kubeconfig", name);
        }
        let config = Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(name.to_string()),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("loading context {:?}", name))?;
        let server_url = config.cluster_url.to_string();
        let client = Client::try_from(config).context("building client for new context")?;
        let next = HubState {
            client,
            context: name.to_string(),
            server_url,
            source: current.source,
            kubeconfig_path: current.kubeconfig_path.clone(),
        };
        self.state.store(Arc::new(next));
        self.resources.write().await.clear();
        self.kinds.store(Arc::new(Vec::new()));
        metrics::counter!("context_switch_total", 1u64);
        info!(context = %name, "switched context");
        Ok(())
    }

    /// Run API discovery and return every served kind. Kinds that cannot be
    /// listed are kept in the result (callers decide what to mirror) but the
    /// descriptor records their verbs.
    pub async fn discover(&self) -> Result<Vec<KindDescriptor>> {
        let discovery = Discovery::new(self.client())
            .run()
            .await
            .context("running API discovery")?;
        let mut out = Vec::new();
        let mut cache = self.resources.write().await;
        cache.clear();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                let desc = KindDescriptor {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced,
                    verbs: caps.operations.iter().map(|v| v.to_string()).collect(),
                    is_custom: !is_builtin_group(&ar.group),
                };
                cache.insert(desc.gvk_key(), (ar.clone(), namespaced));
                out.push(desc);
            }
        }
        drop(cache);
        out.sort_by(|a, b| {
            a.group
                .cmp(&b.group)
                .then(a.version.cmp(&b.version))
                .then(a.kind.cmp(&b.kind))
        });
        self.kinds.store(Arc::new(out.clone()));
        info!(count = out.len(), "discovery complete");
        Ok(out)
    }

    /// Discovered kinds from the last `discover` run.
    pub fn kinds(&self) -> Arc<Vec<KindDescriptor>> {
        self.kinds.load_full()
    }

    /// Resolve an `ApiResource` for a GVK key ("v1/Pod" or
    /// "apps/v1/Deployment"), running discovery on a cache miss.
    pub async fn api_resource(&self, gvk_key: &str) -> Result<(ApiResource, bool)> {
        if let Some(hit) = self.resources.read().await.get(gvk_key).cloned() {
            return Ok(hit);
        }
        let gvk = parse_gvk_key(gvk_key)?;
        let discovery = Discovery::new(self.client())
            .run()
            .await
            .context("running API discovery")?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    self.resources
                        .write()
                        .await
                        .insert(gvk_key.to_string(), (ar.clone(), namespaced));
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(anyhow!("kind not served: {}", gvk_key))
    }

    /// Find a served kind by its singular capitalised name ("Deployment").
    /// Ambiguity resolves to the non-custom kind first, then first match.
    pub fn descriptor_for_kind(&self, kind: &str) -> Option<KindDescriptor> {
        let kinds = self.kinds.load();
        kinds
            .iter()
            .find(|d| d.kind == kind && !d.is_custom)
            .or_else(|| kinds.iter().find(|d| d.kind == kind))
            .cloned()
    }

    /// A dynamic-object handle scoped per the kind and namespace.
    pub async fn dynamic_api(
        &self,
        gvk_key: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.api_resource(gvk_key).await?;
        let client = self.client();
        Ok(if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => Api::all_with(client, &ar),
            }
        } else {
            Api::all_with(client, &ar)
        })
    }

    /// Subject-access probe: may the current identity perform `verb` on the
    /// resource? Errors and timeouts count as denial upstream; here they are
    /// returned so the caller can log the reason.
    pub async fn can_i(
        &self,
        namespace: Option<&str>,
        group: &str,
        resource: &str,
        subresource: Option<&str>,
        verb: &str,
    ) -> Result<bool> {
        use k8s_openapi::api::authorization::v1::{
            ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
        };
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client());
        let ra = ResourceAttributes {
            group: if group.is_empty() {
                None
            } else {
                Some(group.to_string())
            },
            resource: Some(resource.to_string()),
            subresource: subresource.map(|s| s.to_string()),
            verb: Some(verb.to_string()),
            namespace: namespace.map(|s| s.to_string()),
            ..Default::default()
        };
        let ssar = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ra),
                ..Default::default()
            },
            ..Default::default()
        };
        let pp = kube::api::PostParams::default();
        let probe = api.create(&pp, &ssar);
        let created = tokio::time::timeout(std::time::Duration::from_secs(5), probe)
            .await
            .map_err(|_| anyhow!("subject access probe timed out"))?
            .context("subject access probe")?;
        Ok(created.status.map(|s| s.allowed).unwrap_or(false))
    }

    /// Best-effort platform flavour for display: looks for vendor API groups
    /// first, then well-known local-dev context names.
    pub fn platform_flavour(&self) -> &'static str {
        let kinds = self.kinds.load();
        if kinds.iter().any(|d| d.group.ends_with("openshift.io")) {
            return "openshift";
        }
        let ctx = self.context_name();
        for marker in ["kind-", "minikube", "k3d-", "docker-desktop", "rancher-desktop"] {
            if ctx.starts_with(marker) || ctx == marker.trim_end_matches('-') {
                return "local";
            }
        }
        "kubernetes"
    }
}

fn is_builtin_group(group: &str) -> bool {
    group.is_empty()
        || matches!(group, "apps" | "batch" | "autoscaling" | "policy")
        || group.ends_with(".k8s.io")
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] if !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!(
            "invalid gvk key: {} (expect v1/Kind or group/v1/Kind)",
            key
        )),
    }
}

pub fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gvk_key_core_and_grouped() {
        let core = parse_gvk_key("v1/ConfigMap").expect("core key");
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");
        assert_eq!(core.kind, "ConfigMap");

        let grouped = parse_gvk_key("apps/v1/Deployment").expect("grouped key");
        assert_eq!(grouped.group, "apps");
        assert_eq!(grouped.kind, "Deployment");
    }

    #[test]
    fn parse_gvk_key_rejects_garbage() {
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("onlyone").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }

    #[test]
    fn builtin_group_detection() {
        assert!(is_builtin_group(""));
        assert!(is_builtin_group("apps"));
        assert!(is_builtin_group("networking.k8s.io"));
        assert!(!is_builtin_group("cert-manager.io"));
        assert!(!is_builtin_group("argoproj.io"));
    }
}
