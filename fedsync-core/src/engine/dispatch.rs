//! Per-cluster diff and apply.

use crate::adapter::Adapter;
use crate::client::{to_manifest, to_object, ResourceClient};
use crate::config::SyncControllerConfig;
use crate::error::{SyncError, SyncResult};
use crate::object::{is_being_deleted, is_managed, ObjectKey};
use crate::retry::retry_with_backoff;
use crate::status::ClusterOutcome;
use kube::api::DynamicObject;
use serde_json::Value;
use std::sync::Arc;

/// Mutation needed to bring one cluster to the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAction {
    /// Desired but absent.
    Create,
    /// Present and desired but not equivalent.
    Update,
    /// Present but not desired.
    Delete,
    /// Nothing to do.
    NoOp,
}

/// Decide what to do in one cluster.
///
/// `observed` must already be known to carry the managed marker when it is
/// present; unmarked objects are never touched.
pub fn plan(
    adapter: &dyn Adapter,
    desired: Option<&Value>,
    observed: Option<&DynamicObject>,
) -> SyncResult<ClusterAction> {
    Ok(match (desired, observed) {
        (Some(_), None) => ClusterAction::Create,
        (Some(desired), Some(observed)) => {
            if adapter.equivalent(desired, &to_manifest(observed)?) {
                ClusterAction::NoOp
            } else {
                ClusterAction::Update
            }
        }
        (None, Some(_)) => ClusterAction::Delete,
        (None, None) => ClusterAction::NoOp,
    })
}

/// Drives one cluster to the desired state within one reconcile.
pub(crate) struct ClusterSync<'a> {
    pub adapter: &'a dyn Adapter,
    pub config: &'a SyncControllerConfig,
    pub cluster: &'a str,
    pub client: Arc<dyn ResourceClient>,
    pub key: &'a ObjectKey,
}

impl ClusterSync<'_> {
    /// Converge the cluster towards `desired` (`None` = must not exist).
    ///
    /// Transient errors are retried with backoff up to the configured bound;
    /// conflicts trigger an immediate re-fetch and re-diff. Never fails: the
    /// result is always an outcome for status. Failures left over after the
    /// retry bound are marked retryable; rejections are not.
    pub async fn run(&self, desired: Option<&Value>) -> ClusterOutcome {
        let wanted = desired.is_some();
        match self.converge(desired).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() || e.is_conflict() || e.is_not_found() => {
                tracing::warn!(
                    cluster = %self.cluster,
                    key = %self.key,
                    error = %e,
                    "Failed to sync cluster, retries exhausted"
                );
                ClusterOutcome::failed_retryable(self.cluster, wanted, e.to_string())
            }
            Err(e) => {
                tracing::warn!(
                    cluster = %self.cluster,
                    key = %self.key,
                    error = %e,
                    "Member cluster rejected change"
                );
                ClusterOutcome::failed(self.cluster, wanted, e.to_string())
            }
        }
    }

    async fn converge(&self, desired: Option<&Value>) -> SyncResult<ClusterOutcome> {
        let wanted = desired.is_some();
        let rounds = self.config.conflict_retries + 1;

        for round in 1..=rounds {
            let observed = self.fetch().await?;

            if let Some(obj) = &observed {
                if !is_managed(obj, self.adapter.kind()) {
                    if wanted {
                        return Ok(ClusterOutcome::failed(
                            self.cluster,
                            true,
                            format!(
                                "{} {} already exists and is not managed",
                                self.adapter.target_resource().kind,
                                self.key
                            ),
                        ));
                    }
                    return Ok(ClusterOutcome::deleted(self.cluster));
                }
                if is_being_deleted(obj) {
                    return Ok(ClusterOutcome::pending(
                        self.cluster,
                        wanted,
                        "waiting for object deletion to complete",
                    ));
                }
            }

            let action = plan(self.adapter, desired, observed.as_ref())?;
            let result = match (action, desired, &observed) {
                (ClusterAction::NoOp, Some(_), _) => {
                    tracing::debug!(cluster = %self.cluster, key = %self.key, "In sync");
                    return Ok(ClusterOutcome::propagated(self.cluster));
                }
                (ClusterAction::NoOp, None, _) => {
                    return Ok(ClusterOutcome::deleted(self.cluster));
                }
                (ClusterAction::Create, Some(desired), _) => self.create(desired).await,
                (ClusterAction::Update, Some(desired), Some(observed)) => {
                    self.update(desired, observed).await
                }
                (ClusterAction::Delete, _, _) => self.delete().await,
                _ => {
                    return Err(SyncError::AdapterRejected(format!(
                        "inconsistent diff {:?} for {}",
                        action, self.key
                    )));
                }
            };

            match result {
                Ok(()) => {
                    tracing::info!(
                        cluster = %self.cluster,
                        key = %self.key,
                        action = ?action,
                        "Applied change to member cluster"
                    );
                    return Ok(if wanted {
                        ClusterOutcome::propagated(self.cluster)
                    } else {
                        ClusterOutcome::deleted(self.cluster)
                    });
                }
                Err(e) if e.is_conflict() && round < rounds => {
                    tracing::debug!(
                        cluster = %self.cluster,
                        key = %self.key,
                        round = round,
                        error = %e,
                        "Conflict, re-fetching"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::Conflict(format!(
            "{} still conflicting after {} attempts",
            self.key, rounds
        )))
    }

    async fn fetch(&self) -> SyncResult<Option<DynamicObject>> {
        let client = &self.client;
        let key = self.key;
        retry_with_backoff(
            &self.config.retry(),
            "get member object",
            SyncError::is_transient,
            move || client.get_opt(key),
        )
        .await
    }

    async fn create(&self, desired: &Value) -> SyncResult<()> {
        let obj = to_object(desired.clone())?;
        let client = &self.client;
        let obj = &obj;
        retry_with_backoff(
            &self.config.retry(),
            "create member object",
            SyncError::is_transient,
            move || client.create(obj),
        )
        .await
        .map(|_| ())
    }

    async fn update(&self, desired: &Value, observed: &DynamicObject) -> SyncResult<()> {
        let mut manifest = desired.clone();
        self.adapter.retain(&mut manifest, &to_manifest(observed)?);
        let mut obj = to_object(manifest)?;
        obj.metadata.resource_version = observed.metadata.resource_version.clone();

        let client = &self.client;
        let obj = &obj;
        retry_with_backoff(
            &self.config.retry(),
            "update member object",
            SyncError::is_transient,
            move || client.update(obj),
        )
        .await
        .map(|_| ())
    }

    async fn delete(&self) -> SyncResult<()> {
        let client = &self.client;
        let key = self.key;
        let result = retry_with_backoff(
            &self.config.retry(),
            "delete member object",
            SyncError::is_transient,
            move || client.delete(key),
        )
        .await;

        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::TemplateAdapter;
    use crate::memory::{Fault, MemoryCluster, Verb};
    use crate::object::{FEDERATED_KIND_ANNOTATION, MANAGED_LABEL};
    use crate::status::ClusterSyncStatus;
    use serde_json::json;

    fn desired(mode: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "settings",
                "namespace": "apps",
                "labels": { MANAGED_LABEL: "true" },
                "annotations": { FEDERATED_KIND_ANNOTATION: "FederatedConfigMap" }
            },
            "data": { "mode": mode }
        })
    }

    fn config() -> SyncControllerConfig {
        SyncControllerConfig::default().minimize_latency()
    }

    #[test]
    fn plan_covers_every_case() {
        let adapter = TemplateAdapter::config_map();
        let current = to_object(desired("fast")).unwrap();

        assert_eq!(
            plan(&adapter, Some(&desired("fast")), None).unwrap(),
            ClusterAction::Create
        );
        assert_eq!(
            plan(&adapter, Some(&desired("fast")), Some(&current)).unwrap(),
            ClusterAction::NoOp
        );
        assert_eq!(
            plan(&adapter, Some(&desired("slow")), Some(&current)).unwrap(),
            ClusterAction::Update
        );
        assert_eq!(
            plan(&adapter, None, Some(&current)).unwrap(),
            ClusterAction::Delete
        );
        assert_eq!(plan(&adapter, None, None).unwrap(), ClusterAction::NoOp);
    }

    #[tokio::test]
    async fn creates_then_noops() {
        let adapter = TemplateAdapter::config_map();
        let config = config();
        let cluster = MemoryCluster::new("a");
        let key = ObjectKey::new("apps", "settings");
        let sync = ClusterSync {
            adapter: &adapter,
            config: &config,
            cluster: "a",
            client: Arc::new(cluster.client(adapter.target_resource())),
            key: &key,
        };

        let outcome = sync.run(Some(&desired("fast"))).await;
        assert_eq!(outcome.status, ClusterSyncStatus::Propagated);
        assert_eq!(cluster.mutation_count(), 1);

        let outcome = sync.run(Some(&desired("fast"))).await;
        assert_eq!(outcome.status, ClusterSyncStatus::Propagated);
        assert_eq!(cluster.mutation_count(), 1);
    }

    #[tokio::test]
    async fn conflict_is_retried_after_refetch() {
        let adapter = TemplateAdapter::config_map();
        let config = config();
        let cluster = MemoryCluster::new("a");
        let client = cluster.client(adapter.target_resource());
        client.create(&to_object(desired("fast")).unwrap()).await.unwrap();

        cluster.inject_fault(Some(Verb::Update), Fault::Conflict);
        let key = ObjectKey::new("apps", "settings");
        let sync = ClusterSync {
            adapter: &adapter,
            config: &config,
            cluster: "a",
            client: Arc::new(client.clone()),
            key: &key,
        };

        let outcome = sync.run(Some(&desired("slow"))).await;
        assert_eq!(outcome.status, ClusterSyncStatus::Propagated);
        assert_eq!(client.peek(&key).unwrap().data["data"]["mode"], "slow");
    }

    #[tokio::test]
    async fn exhausted_transient_retries_fail_the_cluster() {
        let adapter = TemplateAdapter::config_map();
        let config = config();
        let cluster = MemoryCluster::new("a");
        for _ in 0..config.retry_attempts {
            cluster.inject_fault(Some(Verb::Create), Fault::Transient);
        }
        let key = ObjectKey::new("apps", "settings");
        let sync = ClusterSync {
            adapter: &adapter,
            config: &config,
            cluster: "a",
            client: Arc::new(cluster.client(adapter.target_resource())),
            key: &key,
        };

        let outcome = sync.run(Some(&desired("fast"))).await;
        assert_eq!(outcome.status, ClusterSyncStatus::Failed);
        assert!(outcome.retryable);
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn rejection_fails_without_retry() {
        let adapter = TemplateAdapter::config_map();
        let config = config();
        let cluster = MemoryCluster::new("a");
        cluster.inject_fault(Some(Verb::Create), Fault::Rejected);
        let key = ObjectKey::new("apps", "settings");
        let sync = ClusterSync {
            adapter: &adapter,
            config: &config,
            cluster: "a",
            client: Arc::new(cluster.client(adapter.target_resource())),
            key: &key,
        };

        let outcome = sync.run(Some(&desired("fast"))).await;
        assert_eq!(outcome.status, ClusterSyncStatus::Failed);
        assert!(!outcome.retryable);
        assert_eq!(cluster.call_count(Verb::Create), 1);
    }

    #[tokio::test]
    async fn unmanaged_object_is_not_adopted() {
        let adapter = TemplateAdapter::config_map();
        let config = config();
        let cluster = MemoryCluster::new("a");
        let client = cluster.client(adapter.target_resource());
        let mut foreign = desired("mine");
        foreign["metadata"]["labels"] = json!({ "owner": "someone-else" });
        client.create(&to_object(foreign).unwrap()).await.unwrap();
        cluster.clear_mutations();

        let key = ObjectKey::new("apps", "settings");
        let sync = ClusterSync {
            adapter: &adapter,
            config: &config,
            cluster: "a",
            client: Arc::new(client.clone()),
            key: &key,
        };

        let outcome = sync.run(Some(&desired("fast"))).await;
        assert_eq!(outcome.status, ClusterSyncStatus::Failed);
        assert!(!outcome.retryable);
        assert!(outcome.message.unwrap().contains("not managed"));

        let outcome = sync.run(None).await;
        assert_eq!(outcome.status, ClusterSyncStatus::Deleted);
        assert_eq!(cluster.mutation_count(), 0);
        assert!(client.peek(&key).is_some());
    }
}
