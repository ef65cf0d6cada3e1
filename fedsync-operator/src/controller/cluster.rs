//! Member clusters backed by `FederatedCluster` objects.
//!
//! Each `FederatedCluster` names a secret in the host cluster holding a
//! kubeconfig. The source turns those into registry entries, probes each
//! cluster on its own interval and mirrors readiness into the object's
//! status.

use crate::client::{client_from_kubeconfig, parse_kubeconfig, KubeConnection};
use crate::crd::{FederatedCluster, FederatedClusterSpec, FederatedClusterStatus, HealthCheckConfig};
use crate::error::{OperatorError, OperatorResult};
use fedsync_core::client::ClusterConnection;
use fedsync_core::controller::{probe_result, ClusterSource};
use fedsync_core::registry::ClusterRegistry;
use futures::future::BoxFuture;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher::{self, watcher, Config};
use kube::runtime::WatchStreamExt;
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cluster source reading `FederatedCluster` objects from the host cluster.
pub struct FederatedClusterSource {
    client: Client,
    namespace: String,
}

/// A registered member and the probe task serving it.
struct Member {
    fingerprint: String,
    probe: CancellationToken,
}

impl FederatedClusterSource {
    /// Create a source. `namespace` is used for secret references that do
    /// not name one.
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    async fn apply(
        &self,
        cluster: &FederatedCluster,
        registry: &Arc<ClusterRegistry>,
        members: &mut HashMap<String, Member>,
        stop: &CancellationToken,
    ) {
        let name = cluster.name_any();
        let current = members.get(&name).map(|m| m.fingerprint.as_str());

        match self.connect(&name, &cluster.spec, current).await {
            Ok(None) => {
                debug!(cluster = %name, "Federated cluster unchanged");
            }
            Ok(Some((fingerprint, client))) => {
                if let Some(previous) = members.remove(&name) {
                    previous.probe.cancel();
                }

                let connection: Arc<dyn ClusterConnection> =
                    Arc::new(KubeConnection::new(name.clone(), client));
                registry.register(
                    name.clone(),
                    Arc::clone(&connection),
                    cluster.spec.labels.clone(),
                );

                let probe = stop.child_token();
                tokio::spawn(probe_loop(
                    Api::all(self.client.clone()),
                    name.clone(),
                    connection,
                    Arc::clone(registry),
                    cluster.spec.health_check.clone(),
                    probe.clone(),
                ));
                members.insert(name.clone(), Member { fingerprint, probe });

                if status_changed(cluster.status.as_ref(), true, None) {
                    write_status(&Api::all(self.client.clone()), &name, true, None).await;
                }
            }
            Err(e) => {
                warn!(cluster = %name, error = %e, "Failed to connect to member cluster");
                remove(&name, registry, members);

                let message = e.to_string();
                if status_changed(cluster.status.as_ref(), false, Some(message.as_str())) {
                    write_status(&Api::all(self.client.clone()), &name, false, Some(message))
                        .await;
                }
            }
        }
    }

    /// Build a client for a cluster. Returns `None` when nothing it depends
    /// on changed since `current` was computed.
    async fn connect(
        &self,
        name: &str,
        spec: &FederatedClusterSpec,
        current: Option<&str>,
    ) -> OperatorResult<Option<(String, Client)>> {
        let namespace = spec
            .secret_ref
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone());
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets
            .get_opt(&spec.secret_ref.name)
            .await?
            .ok_or_else(|| OperatorError::SecretError {
                namespace: namespace.clone(),
                name: spec.secret_ref.name.clone(),
                reason: "not found".to_string(),
            })?;

        let fingerprint = fingerprint(
            spec,
            &namespace,
            secret.metadata.resource_version.as_deref().unwrap_or_default(),
        );
        if current == Some(fingerprint.as_str()) {
            return Ok(None);
        }

        let source_name = format!("secret {}/{}", namespace, spec.secret_ref.name);
        let data = kubeconfig_data(&secret, &spec.secret_ref.key)?;
        let kubeconfig = parse_kubeconfig(data, &source_name)?;
        let client = client_from_kubeconfig(kubeconfig, &source_name).await?;

        info!(cluster = %name, secret = %source_name, "Loaded member cluster credentials");
        Ok(Some((fingerprint, client)))
    }
}

impl ClusterSource for FederatedClusterSource {
    fn run(
        self: Arc<Self>,
        _host: Arc<dyn ClusterConnection>,
        registry: Arc<ClusterRegistry>,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let clusters: Api<FederatedCluster> = Api::all(self.client.clone());
            let mut watch_stream = watcher(clusters, Config::default())
                .default_backoff()
                .boxed();

            let mut members: HashMap<String, Member> = HashMap::new();
            let mut listed: HashSet<String> = HashSet::new();

            info!("Federated cluster watcher started");

            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    event = watch_stream.next() => event,
                };

                match event {
                    Some(Ok(watcher::Event::Apply(cluster))) => {
                        self.apply(&cluster, &registry, &mut members, &stop).await;
                    }
                    Some(Ok(watcher::Event::Delete(cluster))) => {
                        remove(&cluster.name_any(), &registry, &mut members);
                    }
                    Some(Ok(watcher::Event::Init)) => {
                        listed.clear();
                    }
                    Some(Ok(watcher::Event::InitApply(cluster))) => {
                        listed.insert(cluster.name_any());
                        self.apply(&cluster, &registry, &mut members, &stop).await;
                    }
                    Some(Ok(watcher::Event::InitDone)) => {
                        let stale: Vec<String> = members
                            .keys()
                            .filter(|name| !listed.contains(*name))
                            .cloned()
                            .collect();
                        for name in stale {
                            remove(&name, &registry, &mut members);
                        }
                        registry.mark_synced();
                        info!(clusters = members.len(), "Federated cluster list synced");
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Federated cluster watch error");
                    }
                    None => {
                        warn!("Federated cluster watch stream ended");
                        break;
                    }
                }
            }

            for member in members.values() {
                member.probe.cancel();
            }
        })
    }
}

fn remove(name: &str, registry: &ClusterRegistry, members: &mut HashMap<String, Member>) {
    if let Some(member) = members.remove(name) {
        member.probe.cancel();
    }
    registry.deregister(name);
}

async fn probe_loop(
    clusters: Api<FederatedCluster>,
    name: String,
    connection: Arc<dyn ClusterConnection>,
    registry: Arc<ClusterRegistry>,
    health: HealthCheckConfig,
    stop: CancellationToken,
) {
    let period = Duration::from_secs(u64::from(health.interval_seconds.max(1)));
    let threshold = health.failure_threshold.max(1);
    let mut failures = HashMap::new();

    // The first probe runs one period after registration.
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = stop.cancelled() => break,
            result = connection.probe() => result,
        };

        let was_ready = registry.is_ready(&name);
        let message = result.as_ref().err().map(|e| e.to_string());
        probe_result(&registry, &mut failures, &name, result, threshold);
        let ready = registry.is_ready(&name);

        if ready != was_ready {
            write_status(&clusters, &name, ready, message).await;
        }
    }
}

async fn write_status(
    clusters: &Api<FederatedCluster>,
    name: &str,
    ready: bool,
    message: Option<String>,
) {
    // An explicit null clears a stale message under merge-patch semantics.
    let patch = json!({
        "status": {
            "ready": ready,
            "lastTransitionTime": chrono::Utc::now().to_rfc3339(),
            "message": message,
        }
    });

    if let Err(e) = clusters
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!(cluster = %name, error = %e, "Failed to update federated cluster status");
    }
}

/// Kubeconfig bytes stored under `key` in a secret.
pub fn kubeconfig_data<'a>(secret: &'a Secret, key: &str) -> OperatorResult<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.as_slice())
        .ok_or_else(|| OperatorError::SecretError {
            namespace: secret.namespace().unwrap_or_default(),
            name: secret.name_any(),
            reason: format!("missing key '{}'", key),
        })
}

/// Everything a registered connection depends on. A changed fingerprint
/// means the cluster must be registered again.
fn fingerprint(spec: &FederatedClusterSpec, namespace: &str, secret_version: &str) -> String {
    format!(
        "{}/{}#{}@{}|{:?}|{}x{}",
        namespace,
        spec.secret_ref.name,
        spec.secret_ref.key,
        secret_version,
        spec.labels,
        spec.health_check.interval_seconds,
        spec.health_check.failure_threshold,
    )
}

fn status_changed(
    current: Option<&FederatedClusterStatus>,
    ready: bool,
    message: Option<&str>,
) -> bool {
    match current {
        Some(status) => status.ready != ready || status.message.as_deref() != message,
        None => true,
    }
}
