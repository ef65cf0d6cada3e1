//! Common test utilities for fedsync-core tests.

use fedsync_core::prelude::*;
use kube::api::DynamicObject;
use kube::core::{ApiResource, GroupVersionKind};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Namespace used by every test object.
pub const NAMESPACE: &str = "apps";

/// A federation plane, a host cluster and a set of member clusters, all in
/// memory.
#[allow(dead_code)]
pub struct TestFederation {
    /// Federation plane holding the federated objects.
    pub federation: MemoryCluster,
    /// Host cluster.
    pub host: MemoryCluster,
    /// Member clusters by name.
    pub members: BTreeMap<String, MemoryCluster>,
}

#[allow(dead_code)]
impl TestFederation {
    /// Create a federation with the named member clusters.
    pub fn new(members: &[&str]) -> Self {
        Self {
            federation: MemoryCluster::new("federation"),
            host: MemoryCluster::new("host"),
            members: members
                .iter()
                .map(|name| (name.to_string(), MemoryCluster::new(*name)))
                .collect(),
        }
    }

    /// A cluster source over every member, probing fast.
    pub fn source(&self) -> Arc<dyn ClusterSource> {
        let mut source = StaticClusterSource::new()
            .health_check_interval(Duration::from_millis(20))
            .failure_threshold(1);
        for (name, cluster) in &self.members {
            source = source.with_cluster(name.clone(), Arc::new(cluster.clone()));
        }
        Arc::new(source)
    }

    /// Boot a controller for `kind` in minimal-latency mode.
    pub fn start(&self, kind: &str) -> ControllerFixture {
        ControllerFixture::new(
            kind,
            &AdapterRegistry::with_builtin(),
            Arc::new(self.federation.clone()),
            Arc::new(self.host.clone()),
            self.source(),
        )
        .expect("Failed to start controller")
    }

    /// Client for federated objects of `kind`.
    pub fn federated(&self, kind: &str) -> MemoryResourceClient {
        self.federation.client(&federated_resource(kind))
    }

    /// Client for concrete objects in one member cluster.
    pub fn member(&self, cluster: &str, target: &ApiResource) -> MemoryResourceClient {
        self.members[cluster].client(target)
    }

    /// Member cluster by name.
    pub fn cluster(&self, name: &str) -> &MemoryCluster {
        &self.members[name]
    }
}

/// `v1 ConfigMap`.
pub fn config_map_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"))
}

/// `apps/v1 Deployment`.
#[allow(dead_code)]
pub fn deployment_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"))
}

/// `batch/v1 Job`.
#[allow(dead_code)]
pub fn job_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("batch", "v1", "Job"))
}

/// A `FederatedJob` running one container, placed on `clusters`.
#[allow(dead_code)]
pub fn federated_job(name: &str, parallelism: i64, clusters: &[&str]) -> DynamicObject {
    to_object(json!({
        "apiVersion": "fedsync.io/v1alpha1",
        "kind": "FederatedJob",
        "metadata": { "name": name, "namespace": NAMESPACE },
        "spec": {
            "template": {
                "metadata": { "labels": { "team": "data" } },
                "spec": {
                    "parallelism": parallelism,
                    "template": {
                        "metadata": { "labels": { "app": name } },
                        "spec": {
                            "restartPolicy": "Never",
                            "containers": [{ "name": "migrate", "image": "migrate:1" }]
                        }
                    }
                }
            },
            "placement": { "clusterNames": clusters }
        }
    }))
    .expect("Invalid manifest")
}

/// A `FederatedConfigMap` placed on `clusters`.
pub fn federated_config_map(name: &str, data: Value, clusters: &[&str]) -> DynamicObject {
    to_object(json!({
        "apiVersion": "fedsync.io/v1alpha1",
        "kind": "FederatedConfigMap",
        "metadata": { "name": name, "namespace": NAMESPACE },
        "spec": {
            "template": { "data": data },
            "placement": { "clusterNames": clusters }
        }
    }))
    .expect("Invalid manifest")
}

/// Key of a test object.
pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

/// Current status of a federated object.
#[allow(dead_code)]
pub fn status_of(client: &MemoryResourceClient, name: &str) -> Option<FederatedStatus> {
    client
        .peek(&key(name))
        .and_then(|obj| FederatedStatus::from_value(obj.data.get("status")))
}

/// Whether a federated object reports `phase` with the given per-cluster
/// statuses, and nothing else.
#[allow(dead_code)]
pub fn status_is(
    client: &MemoryResourceClient,
    name: &str,
    phase: FederatedPhase,
    clusters: &[(&str, ClusterSyncStatus)],
) -> bool {
    let Some(status) = status_of(client, name) else {
        return false;
    };
    status.phase == phase
        && status.clusters.len() == clusters.len()
        && clusters
            .iter()
            .all(|(name, s)| status.cluster(name).is_some_and(|entry| entry.status == *s))
}

/// Poll `condition` every 10ms until it holds or `timeout_ms` elapses.
pub async fn wait_for(timeout_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Retry an async write until it stops conflicting with the controller.
#[allow(dead_code)]
pub async fn with_conflict_retry<F, Fut, T>(mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    for _ in 0..20 {
        match op().await {
            Ok(value) => return value,
            Err(e) if e.is_conflict() => {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Err(e) => panic!("Write failed: {}", e),
        }
    }
    panic!("Write kept conflicting");
}
