//! Reconciliation engine.
//!
//! One [`SyncEngine::reconcile`] call is one pass for one federated object:
//!
//! 1. Fetch the federated object. If it is gone, delete the concrete object
//!    from every cluster it was (or may have been) placed in.
//! 2. Compute the desired set: placement ∩ ready clusters.
//! 3. Diff and apply per cluster, concurrently, with bounded retry.
//! 4. Aggregate the outcomes and write status back when it changed.
//!
//! The engine holds no durable state. The only thing remembered between
//! passes is the last-known placement of each object, used to clean up after
//! objects that disappear without a finalizer.

mod dispatch;

pub use dispatch::{plan, ClusterAction};

use crate::adapter::Adapter;
use crate::client::ResourceClient;
use crate::config::SyncControllerConfig;
use crate::error::{SyncError, SyncResult};
use crate::object::{generation, has_finalizer, is_being_deleted, ObjectKey, SYNC_FINALIZER};
use crate::registry::ClusterRegistry;
use crate::status::{ClusterOutcome, ClusterSyncStatus, FederatedStatus, StatusAggregator};
use dispatch::ClusterSync;
use futures::future::join_all;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Result type for reconciliation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Requeue after the specified duration.
    Requeue(Duration),
    /// Requeue after the key's growing backoff delay.
    Backoff,
    /// Don't requeue until the object or a cluster changes.
    Done,
}

impl ReconcileAction {
    /// The follow-up for a set of cluster outcomes. Pending clusters are
    /// revisited after `reschedule`; retryable failures back off per key;
    /// converged objects and rejected changes wait for the next event.
    pub fn for_outcomes(outcomes: &[ClusterOutcome], reschedule: Duration) -> Self {
        if outcomes
            .iter()
            .any(|o| o.status == ClusterSyncStatus::Pending)
        {
            Self::Requeue(reschedule)
        } else if outcomes
            .iter()
            .any(|o| o.status == ClusterSyncStatus::Failed && o.retryable)
        {
            Self::Backoff
        } else {
            Self::Done
        }
    }
}

/// The reconcile state machine for one federated kind.
pub struct SyncEngine {
    adapter: Arc<dyn Adapter>,
    federation: Arc<dyn ResourceClient>,
    registry: Arc<ClusterRegistry>,
    config: SyncControllerConfig,
    placements: Mutex<HashMap<ObjectKey, BTreeSet<String>>>,
}

impl SyncEngine {
    /// Create an engine.
    ///
    /// `federation` must serve the adapter's federated kind.
    pub fn new(
        adapter: Arc<dyn Adapter>,
        federation: Arc<dyn ResourceClient>,
        registry: Arc<ClusterRegistry>,
        config: SyncControllerConfig,
    ) -> Self {
        Self {
            adapter,
            federation,
            registry,
            config,
            placements: Mutex::new(HashMap::new()),
        }
    }

    /// The adapter in use.
    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    /// Last-known placement of an object, if any.
    pub fn last_known_placement(&self, key: &ObjectKey) -> Option<BTreeSet<String>> {
        self.placements.lock().get(key).cloned()
    }

    /// Reconcile one federated object.
    ///
    /// # Errors
    ///
    /// Only failures to reach the federation plane are returned; the caller
    /// retries them with backoff. Configuration errors in the object are
    /// written to its status and reported as [`ReconcileAction::Done`].
    pub async fn reconcile(&self, key: &ObjectKey) -> SyncResult<ReconcileAction> {
        let kind = self.adapter.kind().to_string();
        tracing::debug!(kind = %kind, key = %key, "Reconciling");

        let Some(obj) = self.federation.get_opt(key).await? else {
            return self.reconcile_absent(key).await;
        };

        if is_being_deleted(&obj) {
            return self.reconcile_deleting(key, obj).await;
        }

        let obj = if self.config.use_finalizers && !has_finalizer(&obj, SYNC_FINALIZER) {
            match self.add_finalizer(obj).await? {
                Some(obj) => obj,
                // Deleted concurrently.
                None => return Ok(ReconcileAction::Done),
            }
        } else {
            obj
        };

        let previous = FederatedStatus::from_value(obj.data.get("status"));
        let desired = match self.desired_objects(&obj) {
            Ok(desired) => desired,
            Err(e) if e.is_permanent() => {
                tracing::error!(kind = %kind, key = %key, error = %e, "Federated object is invalid");
                let status = StatusAggregator::failure(generation(&obj), &e, previous.as_ref());
                self.write_status(&obj, status).await?;
                return Ok(ReconcileAction::Done);
            }
            Err(e) => return Err(e),
        };

        let outcomes = self.sync_clusters(key, &desired, previous.as_ref()).await;
        self.remember_placement(key, &desired, &outcomes);

        let status = StatusAggregator::aggregate(generation(&obj), &outcomes, previous.as_ref());
        let action = ReconcileAction::for_outcomes(&outcomes, self.config.reschedule_delay());
        tracing::info!(
            kind = %kind,
            key = %key,
            phase = %status.phase,
            clusters = status.clusters.len(),
            next = ?action,
            "Reconciled federated object"
        );
        self.write_status(&obj, status).await?;
        Ok(action)
    }

    /// Materialize the desired object for every placed cluster.
    ///
    /// Validates the whole object first so a malformed override for any
    /// cluster fails the object, not just that cluster.
    fn desired_objects(&self, obj: &DynamicObject) -> SyncResult<HashMap<String, Value>> {
        self.adapter.template(obj)?;
        let placement = self.adapter.placement(obj)?;

        if let Some(unknown) = placement.iter().find(|c| !self.registry.is_registered(c)) {
            return Err(SyncError::UnknownCluster(unknown.clone()));
        }

        placement
            .into_iter()
            .map(|cluster| {
                let manifest = self.adapter.desired(obj, &cluster)?;
                Ok((cluster, manifest))
            })
            .collect()
    }

    /// Fan out to the placed clusters plus those that may still hold an
    /// object from an earlier pass, and collect one outcome each.
    async fn sync_clusters(
        &self,
        key: &ObjectKey,
        desired: &HashMap<String, Value>,
        previous: Option<&FederatedStatus>,
    ) -> Vec<ClusterOutcome> {
        let known = self.known_clusters(key, previous);
        let mut clusters: BTreeSet<&String> = desired.keys().collect();
        clusters.extend(known.iter().filter(|c| self.registry.is_registered(c)));

        let tasks = clusters.into_iter().map(|cluster| {
            let wanted = desired.get(cluster);
            if self.registry.is_ready(cluster) {
                SyncTask::Run(cluster.as_str(), wanted)
            } else if wanted.is_some() {
                SyncTask::Skip(ClusterOutcome::pending(
                    cluster.as_str(),
                    true,
                    "cluster is not ready",
                ))
            } else {
                SyncTask::Skip(ClusterOutcome::pending(
                    cluster.as_str(),
                    false,
                    "cluster is not ready, deletion pending",
                ))
            }
        });

        let futures = tasks.map(|task| async move {
            match task {
                SyncTask::Skip(outcome) => outcome,
                SyncTask::Run(cluster, wanted) => self.sync_cluster(key, cluster, wanted).await,
            }
        });

        join_all(futures).await
    }

    async fn sync_cluster(
        &self,
        key: &ObjectKey,
        cluster: &str,
        desired: Option<&Value>,
    ) -> ClusterOutcome {
        let connection = match self.registry.client_for(cluster) {
            Ok(connection) => connection,
            Err(_) => {
                return ClusterOutcome::pending(
                    cluster,
                    desired.is_some(),
                    "cluster was deregistered during reconcile",
                );
            }
        };

        ClusterSync {
            adapter: self.adapter.as_ref(),
            config: &self.config,
            cluster,
            client: connection.resource_client(self.adapter.target_resource()),
            key,
        }
        .run(desired)
        .await
    }

    /// Clusters that may hold a concrete object from an earlier pass.
    fn known_clusters(&self, key: &ObjectKey, previous: Option<&FederatedStatus>) -> BTreeSet<String> {
        let mut known = self.last_known_placement(key).unwrap_or_default();
        if let Some(previous) = previous {
            known.extend(previous.clusters.iter().map(|c| c.name.clone()));
        }
        known
    }

    fn remember_placement(
        &self,
        key: &ObjectKey,
        desired: &HashMap<String, Value>,
        outcomes: &[ClusterOutcome],
    ) {
        let mut placement: BTreeSet<String> = desired.keys().cloned().collect();
        placement.extend(
            outcomes
                .iter()
                .filter(|o| !o.desired && o.status != ClusterSyncStatus::Deleted)
                .map(|o| o.cluster.clone()),
        );
        self.placements.lock().insert(key.clone(), placement);
    }

    /// The federated object is gone: remove concrete objects everywhere.
    async fn reconcile_absent(&self, key: &ObjectKey) -> SyncResult<ReconcileAction> {
        let pending = self.delete_everywhere(key, None).await;
        if pending.is_empty() {
            if self.placements.lock().remove(key).is_some() {
                tracing::info!(kind = %self.adapter.kind(), key = %key, "Federated object deleted, cleanup complete");
            }
            Ok(ReconcileAction::Done)
        } else {
            tracing::warn!(
                kind = %self.adapter.kind(),
                key = %key,
                pending = ?pending,
                "Federated object deleted, cleanup pending"
            );
            self.placements.lock().insert(key.clone(), pending);
            Ok(ReconcileAction::Requeue(self.config.reschedule_delay()))
        }
    }

    /// The federated object is being deleted: clean up, then release it.
    async fn reconcile_deleting(
        &self,
        key: &ObjectKey,
        obj: DynamicObject,
    ) -> SyncResult<ReconcileAction> {
        if !has_finalizer(&obj, SYNC_FINALIZER) {
            return Ok(ReconcileAction::Done);
        }

        let previous = FederatedStatus::from_value(obj.data.get("status"));
        let pending = self.delete_everywhere(key, previous.as_ref()).await;
        if !pending.is_empty() {
            tracing::warn!(
                kind = %self.adapter.kind(),
                key = %key,
                pending = ?pending,
                "Deletion waiting on member clusters"
            );
            self.placements.lock().insert(key.clone(), pending);
            return Ok(ReconcileAction::Requeue(self.config.reschedule_delay()));
        }

        self.remove_finalizer(obj).await?;
        self.placements.lock().remove(key);
        tracing::info!(kind = %self.adapter.kind(), key = %key, "Removed finalizer after cleanup");
        Ok(ReconcileAction::Done)
    }

    /// Delete the concrete object from every ready cluster. Returns the
    /// clusters where deletion could not be confirmed.
    async fn delete_everywhere(
        &self,
        key: &ObjectKey,
        previous: Option<&FederatedStatus>,
    ) -> BTreeSet<String> {
        let known = self.known_clusters(key, previous);
        let clusters = self.registry.clusters();

        let futures = clusters.iter().map(|cluster| {
            let known = known.contains(cluster);
            async move {
                if !self.registry.is_ready(cluster) {
                    return known.then(|| cluster.clone());
                }
                let outcome = self.sync_cluster(key, cluster, None).await;
                (outcome.status != ClusterSyncStatus::Deleted).then(|| cluster.clone())
            }
        });

        join_all(futures).await.into_iter().flatten().collect()
    }

    /// Add the sync finalizer. Returns the updated object, or `None` when
    /// the object vanished concurrently.
    async fn add_finalizer(&self, mut obj: DynamicObject) -> SyncResult<Option<DynamicObject>> {
        obj.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(SYNC_FINALIZER.to_string());
        match self.federation.update(&obj).await {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn remove_finalizer(&self, mut obj: DynamicObject) -> SyncResult<()> {
        if let Some(finalizers) = obj.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != SYNC_FINALIZER);
        }
        match self.federation.update(&obj).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Write status if it differs from what is stored. Conflicts re-read the
    /// object; a concurrent spec change abandons the write since the change
    /// feed schedules another pass.
    async fn write_status(&self, obj: &DynamicObject, status: FederatedStatus) -> SyncResult<()> {
        let value = self.adapter.apply_status(obj, &status)?;
        let key = ObjectKey::of(obj);
        let mut current = obj.clone();

        for _ in 0..=self.config.conflict_retries {
            if current.data.get("status") == Some(&value) {
                tracing::debug!(key = %key, "Status unchanged");
                return Ok(());
            }

            let mut updated = current.clone();
            updated.data["status"] = value.clone();
            match self.federation.update_status(&updated).await {
                Ok(_) => {
                    tracing::debug!(key = %key, phase = %status.phase, "Wrote status");
                    return Ok(());
                }
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if e.is_conflict() => match self.federation.get_opt(&key).await? {
                    Some(fresh) if generation(&fresh) == generation(obj) => current = fresh,
                    _ => return Ok(()),
                },
                Err(e) => return Err(e),
            }
        }

        Err(SyncError::Conflict(format!(
            "status of {} kept conflicting",
            key
        )))
    }
}

enum SyncTask<'a> {
    Skip(ClusterOutcome),
    Run(&'a str, Option<&'a Value>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{federated_resource, TemplateAdapter};
    use crate::client::to_object;
    use crate::memory::{Fault, MemoryCluster, MemoryResourceClient, Verb};
    use crate::object::{FEDERATED_KIND_ANNOTATION, MANAGED_LABEL};
    use crate::status::FederatedPhase;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Harness {
        engine: SyncEngine,
        federation: MemoryResourceClient,
        registry: Arc<ClusterRegistry>,
        members: Vec<(MemoryCluster, MemoryResourceClient)>,
    }

    fn harness(members: &[&str]) -> Harness {
        let adapter = TemplateAdapter::config_map();
        let federation = MemoryCluster::new("federation").client(&federated_resource("FederatedConfigMap"));
        let registry = Arc::new(ClusterRegistry::new());
        let members = members
            .iter()
            .map(|name| {
                let cluster = MemoryCluster::new(*name);
                registry.register(*name, Arc::new(cluster.clone()), BTreeMap::new());
                let client = cluster.client(adapter.target_resource());
                (cluster, client)
            })
            .collect();
        let engine = SyncEngine::new(
            Arc::new(adapter),
            Arc::new(federation.clone()),
            Arc::clone(&registry),
            SyncControllerConfig::default().minimize_latency(),
        );
        Harness {
            engine,
            federation,
            registry,
            members,
        }
    }

    fn settings(clusters: &[&str]) -> DynamicObject {
        to_object(json!({
            "apiVersion": "fedsync.io/v1alpha1",
            "kind": "FederatedConfigMap",
            "metadata": { "name": "settings", "namespace": "apps" },
            "spec": {
                "template": { "data": { "mode": "fast" } },
                "placement": { "clusterNames": clusters }
            }
        }))
        .unwrap()
    }

    fn key() -> ObjectKey {
        ObjectKey::new("apps", "settings")
    }

    fn phase(h: &Harness) -> Option<FederatedPhase> {
        h.federation
            .peek(&key())
            .and_then(|obj| FederatedStatus::from_value(obj.data.get("status")))
            .map(|s| s.phase)
    }

    #[tokio::test]
    async fn propagates_and_adds_finalizer() {
        let h = harness(&["a", "b"]);
        h.federation.create(&settings(&["a", "b"])).await.unwrap();

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert_eq!(phase(&h), Some(FederatedPhase::Propagated));
        for (_, client) in &h.members {
            assert!(client.peek(&key()).is_some());
        }
        let stored = h.federation.peek(&key()).unwrap();
        assert!(has_finalizer(&stored, SYNC_FINALIZER));
        assert_eq!(
            h.engine.last_known_placement(&key()),
            Some(BTreeSet::from(["a".to_string(), "b".to_string()]))
        );
    }

    #[tokio::test]
    async fn unready_cluster_requeues() {
        let h = harness(&["a", "b"]);
        h.registry.set_ready("b", false);
        h.federation.create(&settings(&["a", "b"])).await.unwrap();

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert!(matches!(action, ReconcileAction::Requeue(_)));
        assert_eq!(phase(&h), Some(FederatedPhase::Pending));
        assert!(h.members[0].1.peek(&key()).is_some());
        assert!(h.members[1].1.peek(&key()).is_none());
        assert_eq!(h.members[1].0.mutation_count(), 0);
    }

    #[tokio::test]
    async fn deletion_waits_for_unready_cluster() {
        let h = harness(&["a", "b"]);
        h.federation.create(&settings(&["a", "b"])).await.unwrap();
        h.engine.reconcile(&key()).await.unwrap();

        h.registry.set_ready("b", false);
        h.federation.delete(&key()).await.unwrap();

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert!(matches!(action, ReconcileAction::Requeue(_)));
        assert!(h.members[0].1.peek(&key()).is_none());
        assert!(h.members[1].1.peek(&key()).is_some());
        let stored = h.federation.peek(&key()).expect("finalizer must hold the object");
        assert!(has_finalizer(&stored, SYNC_FINALIZER));

        h.registry.set_ready("b", true);
        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert!(h.members[1].1.peek(&key()).is_none());
        assert!(h.federation.peek(&key()).is_none());
    }

    #[tokio::test]
    async fn absent_object_is_swept_from_last_known_placement() {
        let h = harness(&["a"]);
        h.federation.create(&settings(&["a"])).await.unwrap();
        h.engine.reconcile(&key()).await.unwrap();
        assert!(h.members[0].1.peek(&key()).is_some());

        // Strip the finalizer out from under the engine, then delete.
        let mut stored = h.federation.peek(&key()).unwrap();
        stored.metadata.finalizers = None;
        h.federation.update(&stored).await.unwrap();
        h.federation.delete(&key()).await.unwrap();
        assert!(h.federation.peek(&key()).is_none());

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert!(h.members[0].1.peek(&key()).is_none());
        assert_eq!(h.engine.last_known_placement(&key()), None);
    }

    #[tokio::test]
    async fn invalid_override_is_written_to_status() {
        let h = harness(&["a"]);
        let obj = to_object(json!({
            "apiVersion": "fedsync.io/v1alpha1",
            "kind": "FederatedConfigMap",
            "metadata": { "name": "settings", "namespace": "apps" },
            "spec": {
                "template": { "data": {} },
                "placement": { "clusterNames": ["a"] },
                "overrides": [{ "clusterName": "a", "patch": "nope" }]
            }
        }))
        .unwrap();
        h.federation.create(&obj).await.unwrap();

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert_eq!(phase(&h), Some(FederatedPhase::Failed));
        assert_eq!(h.members[0].0.mutation_count(), 0);
    }

    #[tokio::test]
    async fn rejected_change_is_not_requeued() {
        let h = harness(&["a"]);
        h.members[0].0.inject_fault(Some(Verb::Create), Fault::Rejected);
        h.federation.create(&settings(&["a"])).await.unwrap();

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert_eq!(phase(&h), Some(FederatedPhase::Failed));
        assert_eq!(h.members[0].0.call_count(Verb::Create), 1);
    }

    #[tokio::test]
    async fn unmanaged_object_in_the_way_is_not_requeued() {
        let h = harness(&["a"]);
        let foreign = to_object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings", "namespace": "apps" },
            "data": { "mode": "theirs" }
        }))
        .unwrap();
        h.members[0].1.create(&foreign).await.unwrap();
        h.federation.create(&settings(&["a"])).await.unwrap();

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert_eq!(phase(&h), Some(FederatedPhase::Failed));
        let stored = h.members[0].1.peek(&key()).unwrap();
        assert_eq!(stored.data["data"]["mode"], "theirs");
    }

    #[tokio::test]
    async fn exhausted_transient_retries_back_off() {
        let h = harness(&["a"]);
        for _ in 0..h.engine.config.retry_attempts {
            h.members[0].0.inject_fault(Some(Verb::Create), Fault::Transient);
        }
        h.federation.create(&settings(&["a"])).await.unwrap();

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Backoff);
        assert_eq!(phase(&h), Some(FederatedPhase::Failed));

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert_eq!(phase(&h), Some(FederatedPhase::Propagated));
    }

    #[tokio::test]
    async fn pending_cluster_wins_over_failure() {
        let h = harness(&["a", "b"]);
        h.members[0].0.inject_fault(Some(Verb::Create), Fault::Rejected);
        h.registry.set_ready("b", false);
        h.federation.create(&settings(&["a", "b"])).await.unwrap();

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue(h.engine.config.reschedule_delay()));
    }

    #[test]
    fn action_for_outcomes() {
        let delay = Duration::from_millis(100);
        let action = |outcomes: &[ClusterOutcome]| ReconcileAction::for_outcomes(outcomes, delay);

        assert_eq!(action(&[]), ReconcileAction::Done);
        assert_eq!(
            action(&[ClusterOutcome::propagated("a"), ClusterOutcome::deleted("b")]),
            ReconcileAction::Done
        );
        assert_eq!(
            action(&[ClusterOutcome::failed("a", true, "422")]),
            ReconcileAction::Done
        );
        assert_eq!(
            action(&[
                ClusterOutcome::failed("a", true, "422"),
                ClusterOutcome::failed_retryable("b", true, "timeout"),
            ]),
            ReconcileAction::Backoff
        );
        assert_eq!(
            action(&[
                ClusterOutcome::failed_retryable("a", true, "timeout"),
                ClusterOutcome::pending("b", true, "cluster is not ready"),
            ]),
            ReconcileAction::Requeue(delay)
        );
    }

    #[tokio::test]
    async fn unplaced_clusters_are_not_contacted() {
        let h = harness(&["a", "b"]);
        h.federation.create(&settings(&["a"])).await.unwrap();

        h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(h.members[1].0.call_count(Verb::Get), 0);

        // Moving the object still visits the cluster it leaves.
        let mut stored = h.federation.peek(&key()).unwrap();
        stored.data["spec"]["placement"]["clusterNames"] = json!(["b"]);
        h.federation.update(&stored).await.unwrap();
        let gets_before = h.members[0].0.call_count(Verb::Get);

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert!(h.members[0].0.call_count(Verb::Get) > gets_before);
        assert!(h.members[0].1.peek(&key()).is_none());
        assert!(h.members[1].1.peek(&key()).is_some());
    }

    #[tokio::test]
    async fn sweep_leaves_objects_of_other_kinds() {
        let h = harness(&["a"]);
        let other = to_object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "settings",
                "namespace": "apps",
                "labels": { MANAGED_LABEL: "true" },
                "annotations": { FEDERATED_KIND_ANNOTATION: "FederatedSettings" }
            },
            "data": { "mode": "other" }
        }))
        .unwrap();
        h.members[0].1.create(&other).await.unwrap();
        h.members[0].0.clear_mutations();

        let action = h.engine.reconcile(&key()).await.unwrap();
        assert_eq!(action, ReconcileAction::Done);
        assert!(h.members[0].1.peek(&key()).is_some());
        assert_eq!(h.members[0].0.mutation_count(), 0);
    }
}
