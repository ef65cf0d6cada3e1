//! Controller lifecycle.
//!
//! [`start_sync_controller`] wires a change feed, a work queue, a worker
//! pool and a cluster source around one [`SyncEngine`] and runs them until a
//! stop signal fires. [`ControllerManager`] keeps the running controllers
//! keyed by kind.

use crate::adapter::AdapterRegistry;
use crate::client::ClusterConnection;
use crate::config::SyncControllerConfig;
use crate::engine::{ReconcileAction, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::feed::ChangeFeed;
use crate::object::ObjectKey;
use crate::queue::WorkQueue;
use crate::registry::ClusterRegistry;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Readiness of a controller, published on a watch channel.
///
/// The controller never exits because the federation plane is unreachable;
/// it reports it here and keeps retrying.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerHealth {
    /// Whether the last list of the federation plane succeeded.
    pub federation_reachable: bool,
    /// Last federation-plane error, if any.
    pub last_error: Option<String>,
}

/// Supplies member clusters to a registry.
///
/// Implementations register the clusters they know about, call
/// [`ClusterRegistry::mark_synced`] once the initial set is in, then keep the
/// registry current (registrations, removals, readiness) until `stop` fires.
pub trait ClusterSource: Send + Sync {
    /// Run until `stop` fires. `host` is the cluster holding federation
    /// control objects such as cluster credentials.
    fn run(
        self: Arc<Self>,
        host: Arc<dyn ClusterConnection>,
        registry: Arc<ClusterRegistry>,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}

/// A fixed set of clusters with periodic health probing.
pub struct StaticClusterSource {
    clusters: Vec<(String, Arc<dyn ClusterConnection>, BTreeMap<String, String>)>,
    health_check_interval: Duration,
    failure_threshold: u32,
}

impl Default for StaticClusterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticClusterSource {
    /// An empty source probing every 10 seconds, flipping readiness after
    /// 3 consecutive failures.
    pub fn new() -> Self {
        Self {
            clusters: Vec::new(),
            health_check_interval: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }

    /// Add a cluster.
    pub fn with_cluster(
        mut self,
        name: impl Into<String>,
        connection: Arc<dyn ClusterConnection>,
    ) -> Self {
        self.clusters
            .push((name.into(), connection, BTreeMap::new()));
        self
    }

    /// Add a cluster with labels.
    pub fn with_labelled_cluster(
        mut self,
        name: impl Into<String>,
        connection: Arc<dyn ClusterConnection>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        self.clusters.push((name.into(), connection, labels));
        self
    }

    /// Set the probe interval.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the consecutive failures needed to mark a cluster unready.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }
}

impl ClusterSource for StaticClusterSource {
    fn run(
        self: Arc<Self>,
        _host: Arc<dyn ClusterConnection>,
        registry: Arc<ClusterRegistry>,
        stop: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            for (name, connection, labels) in &self.clusters {
                registry.register(name.clone(), Arc::clone(connection), labels.clone());
            }
            registry.mark_synced();

            let mut failures: HashMap<String, u32> = HashMap::new();
            let mut ticker = tokio::time::interval(self.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let probes = self.clusters.iter().map(|(name, connection, _)| async move {
                    (name.as_str(), connection.probe().await)
                });
                for (name, result) in join_all(probes).await {
                    probe_result(&registry, &mut failures, name, result, self.failure_threshold);
                }
            }
        })
    }
}

/// Apply one probe result to the registry.
pub fn probe_result(
    registry: &ClusterRegistry,
    failures: &mut HashMap<String, u32>,
    name: &str,
    result: SyncResult<()>,
    threshold: u32,
) {
    match result {
        Ok(()) => {
            failures.remove(name);
            registry.set_ready(name, true);
        }
        Err(e) => {
            let count = failures.entry(name.to_string()).or_insert(0);
            *count += 1;
            tracing::debug!(cluster = %name, failures = *count, error = %e, "Cluster probe failed");
            if *count >= threshold {
                registry.set_ready(name, false);
            }
        }
    }
}

/// A running sync controller for one federated kind.
pub struct SyncController {
    kind: String,
    stop: CancellationToken,
    health: watch::Receiver<ControllerHealth>,
    engine: Arc<SyncEngine>,
    queue: WorkQueue<ObjectKey>,
    registry: Arc<ClusterRegistry>,
    feed: Arc<ChangeFeed>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncController {
    /// Federated kind served.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Readiness updates.
    pub fn health(&self) -> watch::Receiver<ControllerHealth> {
        self.health.clone()
    }

    /// The engine, for inspection.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// The work queue, for inspection.
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// The member cluster registry.
    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Keys of every federated object seen so far.
    pub fn known_keys(&self) -> Vec<ObjectKey> {
        self.feed.known_keys().into_iter().collect()
    }

    /// Whether the stop signal has fired.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Fire the stop signal. In-flight reconciles finish; nothing new starts.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait for every task to exit. Call after [`stop`](Self::stop) or after
    /// the parent stop signal fired.
    pub async fn join(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in join_all(tasks).await {
            if let Err(e) = task {
                if e.is_panic() {
                    tracing::error!(kind = %self.kind, error = %e, "Controller task panicked");
                }
            }
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Start a sync controller with the default configuration.
///
/// `federation` serves the federated kind, `host` holds federation control
/// objects, and `cluster_source` populates the member cluster registry. The
/// controller runs until `stop` fires. `minimize_latency` shrinks every delay
/// for tests.
pub fn start_sync_controller(
    kind: &str,
    adapters: &AdapterRegistry,
    federation: Arc<dyn ClusterConnection>,
    host: Arc<dyn ClusterConnection>,
    cluster_source: Arc<dyn ClusterSource>,
    stop: CancellationToken,
    minimize_latency: bool,
) -> SyncResult<SyncController> {
    let config = if minimize_latency {
        SyncControllerConfig::default().minimize_latency()
    } else {
        SyncControllerConfig::default()
    };
    start_sync_controller_with_config(kind, adapters, federation, host, cluster_source, stop, config)
}

/// Start a sync controller with an explicit configuration.
pub fn start_sync_controller_with_config(
    kind: &str,
    adapters: &AdapterRegistry,
    federation: Arc<dyn ClusterConnection>,
    host: Arc<dyn ClusterConnection>,
    cluster_source: Arc<dyn ClusterSource>,
    stop: CancellationToken,
    config: SyncControllerConfig,
) -> SyncResult<SyncController> {
    config.validate()?;
    let adapter = adapters.get(kind)?;

    let registry = Arc::new(ClusterRegistry::new());
    let federation_client = federation.resource_client(adapter.federated_resource());
    let queue = WorkQueue::new(config.rate_limit());
    let (health_tx, health_rx) = watch::channel(ControllerHealth::default());

    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&adapter),
        Arc::clone(&federation_client),
        Arc::clone(&registry),
        config.clone(),
    ));
    let feed = Arc::new(ChangeFeed::new(
        kind,
        federation_client,
        adapter.target_resource().clone(),
        Arc::clone(&registry),
        queue.clone(),
        config.clone(),
        health_tx,
    ));

    let token = stop.child_token();
    let mut tasks = Vec::with_capacity(config.workers + 3);

    tasks.push(tokio::spawn(cluster_source.run(
        host,
        Arc::clone(&registry),
        token.clone(),
    )));
    tasks.push(tokio::spawn(Arc::clone(&feed).run(token.clone())));

    for worker in 0..config.workers {
        tasks.push(tokio::spawn(run_worker(
            worker,
            Arc::clone(&engine),
            Arc::clone(&registry),
            queue.clone(),
            token.clone(),
        )));
    }

    {
        let queue = queue.clone();
        let token = token.clone();
        let kind = kind.to_string();
        tasks.push(tokio::spawn(async move {
            token.cancelled().await;
            tracing::info!(kind = %kind, "Stopping sync controller");
            queue.shut_down();
        }));
    }

    tracing::info!(
        kind = %kind,
        target = %adapter.target_resource().kind,
        workers = config.workers,
        minimize_latency = config.minimize_latency,
        "Started sync controller"
    );

    Ok(SyncController {
        kind: kind.to_string(),
        stop: token,
        health: health_rx,
        engine,
        queue,
        registry,
        feed,
        tasks: Mutex::new(tasks),
    })
}

async fn run_worker(
    id: usize,
    engine: Arc<SyncEngine>,
    registry: Arc<ClusterRegistry>,
    queue: WorkQueue<ObjectKey>,
    stop: CancellationToken,
) {
    tokio::select! {
        _ = stop.cancelled() => return,
        _ = registry.wait_synced() => {}
    }

    while let Some(key) = queue.get().await {
        match engine.reconcile(&key).await {
            Ok(ReconcileAction::Done) => {
                queue.forget(&key);
            }
            Ok(ReconcileAction::Requeue(delay)) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            Ok(ReconcileAction::Backoff) => {
                tracing::debug!(
                    worker = id,
                    key = %key,
                    retries = queue.num_requeues(&key),
                    "Member clusters still failing, backing off"
                );
                queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                tracing::warn!(
                    worker = id,
                    key = %key,
                    error = %e,
                    retries = queue.num_requeues(&key),
                    "Reconcile failed, backing off"
                );
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }

    tracing::debug!(worker = id, "Worker stopped");
}

/// Running controllers keyed by kind, with a shared stop signal.
pub struct ControllerManager {
    adapters: AdapterRegistry,
    federation: Arc<dyn ClusterConnection>,
    host: Arc<dyn ClusterConnection>,
    cluster_source: Arc<dyn ClusterSource>,
    config: SyncControllerConfig,
    stop: CancellationToken,
    running: Mutex<HashMap<String, Arc<SyncController>>>,
}

impl ControllerManager {
    /// Create a manager. Nothing runs until [`start`](Self::start).
    pub fn new(
        adapters: AdapterRegistry,
        federation: Arc<dyn ClusterConnection>,
        host: Arc<dyn ClusterConnection>,
        cluster_source: Arc<dyn ClusterSource>,
        config: SyncControllerConfig,
    ) -> Self {
        Self {
            adapters,
            federation,
            host,
            cluster_source,
            config,
            stop: CancellationToken::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Start the controller for a kind.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if a controller for `kind` is running, `UnknownKind`
    /// if no adapter is registered for it, `ShuttingDown` after
    /// [`shutdown`](Self::shutdown).
    pub fn start(&self, kind: &str) -> SyncResult<Arc<SyncController>> {
        if self.stop.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }

        let mut running = self.running.lock();
        if let Some(existing) = running.get(kind) {
            if !existing.is_stopped() {
                return Err(SyncError::AlreadyRunning(kind.to_string()));
            }
        }

        let controller = Arc::new(start_sync_controller_with_config(
            kind,
            &self.adapters,
            Arc::clone(&self.federation),
            Arc::clone(&self.host),
            Arc::clone(&self.cluster_source),
            self.stop.clone(),
            self.config.clone(),
        )?);
        running.insert(kind.to_string(), Arc::clone(&controller));
        Ok(controller)
    }

    /// Stop the controller for a kind and wait for it to exit. Returns false
    /// if none was running.
    pub async fn stop(&self, kind: &str) -> bool {
        let removed = self.running.lock().remove(kind);
        let Some(controller) = removed else {
            return false;
        };
        controller.stop();
        controller.join().await;
        true
    }

    /// The running controller for a kind.
    pub fn get(&self, kind: &str) -> Option<Arc<SyncController>> {
        self.running.lock().get(kind).cloned()
    }

    /// Kinds with a running controller, sorted.
    pub fn running_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .running
            .lock()
            .iter()
            .filter(|(_, c)| !c.is_stopped())
            .map(|(kind, _)| kind.clone())
            .collect();
        kinds.sort();
        kinds
    }

    /// Stop every controller and wait for all of them to exit.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let controllers: Vec<_> = self.running.lock().drain().map(|(_, c)| c).collect();
        for controller in &controllers {
            controller.join().await;
        }
        tracing::info!(count = controllers.len(), "All sync controllers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::federated_resource;
    use crate::client::{to_object, ResourceClient};
    use crate::memory::{Fault, MemoryCluster, MemoryResourceClient, Verb};
    use crate::status::{FederatedPhase, FederatedStatus};
    use kube::api::DynamicObject;
    use serde_json::json;

    fn manager() -> ControllerManager {
        let source = StaticClusterSource::new().with_cluster("a", Arc::new(MemoryCluster::new("a")));
        ControllerManager::new(
            AdapterRegistry::with_builtin(),
            Arc::new(MemoryCluster::new("federation")),
            Arc::new(MemoryCluster::new("host")),
            Arc::new(source),
            SyncControllerConfig::default().minimize_latency(),
        )
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let manager = manager();
        manager.start("FederatedConfigMap").unwrap();
        assert!(matches!(
            manager.start("FederatedConfigMap"),
            Err(SyncError::AlreadyRunning(_))
        ));
        assert_eq!(manager.running_kinds(), vec!["FederatedConfigMap"]);
        manager.shutdown().await;
        assert!(manager.running_kinds().is_empty());
    }

    #[tokio::test]
    async fn stop_then_restart() {
        let manager = manager();
        manager.start("FederatedJob").unwrap();
        assert!(manager.stop("FederatedJob").await);
        assert!(!manager.stop("FederatedJob").await);
        manager.start("FederatedJob").unwrap();
        manager.shutdown().await;
        assert!(matches!(
            manager.start("FederatedJob"),
            Err(SyncError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let manager = manager();
        assert!(matches!(
            manager.start("FederatedSecret"),
            Err(SyncError::UnknownKind(_))
        ));
    }

    #[test]
    fn probe_threshold_flips_readiness() {
        let registry = ClusterRegistry::new();
        registry.register("a", Arc::new(MemoryCluster::new("a")), BTreeMap::new());
        let mut failures = HashMap::new();

        let down = || Err(SyncError::Transient("down".into()));
        probe_result(&registry, &mut failures, "a", down(), 2);
        assert!(registry.is_ready("a"));
        probe_result(&registry, &mut failures, "a", down(), 2);
        assert!(!registry.is_ready("a"));
        probe_result(&registry, &mut failures, "a", Ok(()), 2);
        assert!(registry.is_ready("a"));
    }

    fn settings() -> DynamicObject {
        to_object(json!({
            "apiVersion": "fedsync.io/v1alpha1",
            "kind": "FederatedConfigMap",
            "metadata": { "name": "settings", "namespace": "apps" },
            "spec": {
                "template": { "data": { "mode": "fast" } },
                "placement": { "clusterNames": ["a"] }
            }
        }))
        .unwrap()
    }

    fn key() -> ObjectKey {
        ObjectKey::new("apps", "settings")
    }

    fn start(
        federation: &MemoryCluster,
        source: StaticClusterSource,
        stop: &CancellationToken,
    ) -> SyncController {
        start_sync_controller(
            "FederatedConfigMap",
            &AdapterRegistry::with_builtin(),
            Arc::new(federation.clone()),
            Arc::new(MemoryCluster::new("host")),
            Arc::new(source),
            stop.clone(),
            true,
        )
        .unwrap()
    }

    fn phase(objects: &MemoryResourceClient) -> Option<FederatedPhase> {
        objects
            .peek(&key())
            .and_then(|obj| FederatedStatus::from_value(obj.data.get("status")))
            .map(|status| status.phase)
    }

    async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..3_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_member_is_not_retried_on_a_timer() {
        let federation = MemoryCluster::new("federation");
        let member = MemoryCluster::new("a");
        member.fail_always(Some(Verb::Create), Fault::Rejected);
        let stop = CancellationToken::new();
        let controller = start(
            &federation,
            StaticClusterSource::new().with_cluster("a", Arc::new(member.clone())),
            &stop,
        );
        let objects = federation.client(&federated_resource("FederatedConfigMap"));
        objects.create(&settings()).await.unwrap();

        eventually("failed phase", || phase(&objects) == Some(FederatedPhase::Failed)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let reconciles = federation.call_count(Verb::Get);
        let creates = member.call_count(Verb::Create);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(federation.call_count(Verb::Get), reconciles);
        assert_eq!(member.call_count(Verb::Create), creates);
        assert_eq!(controller.queue().num_requeues(&key()), 0);

        // A spec change is the next chance.
        member.clear_faults();
        let mut changed = objects.peek(&key()).unwrap();
        changed.data["spec"]["template"]["data"]["mode"] = json!("slow");
        objects.update(&changed).await.unwrap();
        eventually("propagated phase", || phase(&objects) == Some(FederatedPhase::Propagated)).await;

        stop.cancel();
        controller.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_member_backs_off_then_settles() {
        let federation = MemoryCluster::new("federation");
        let member = MemoryCluster::new("a");
        member.fail_always(Some(Verb::Create), Fault::Transient);
        let stop = CancellationToken::new();
        let controller = start(
            &federation,
            StaticClusterSource::new().with_cluster("a", Arc::new(member.clone())),
            &stop,
        );
        let objects = federation.client(&federated_resource("FederatedConfigMap"));
        objects.create(&settings()).await.unwrap();

        eventually("backoff to reach its cap", || {
            controller.queue().num_requeues(&key()) >= 10
        })
        .await;
        assert_eq!(phase(&objects), Some(FederatedPhase::Failed));

        // Capped at one second per pass; a fixed 100ms requeue would run ~100.
        let before = member.call_count(Verb::Get);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let passes = member.call_count(Verb::Get) - before;
        assert!((1..=12).contains(&passes), "{} passes in 10s", passes);
        assert!(controller.queue().num_requeues(&key()) >= 10);

        member.clear_faults();
        eventually("propagated phase", || phase(&objects) == Some(FederatedPhase::Propagated)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.queue().num_requeues(&key()), 0);

        // Converged objects stay out of the queue.
        let settled = member.call_count(Verb::Get);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(member.call_count(Verb::Get), settled);
        assert!(controller.queue().is_empty());

        stop.cancel();
        controller.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unready_member_requeues_on_a_fixed_delay() {
        let federation = MemoryCluster::new("federation");
        let member = MemoryCluster::new("a");
        member.set_reachable(false);
        let source = StaticClusterSource::new()
            .with_cluster("a", Arc::new(member.clone()))
            .health_check_interval(Duration::from_millis(50))
            .failure_threshold(1);
        let stop = CancellationToken::new();
        let controller = start(&federation, source, &stop);
        let objects = federation.client(&federated_resource("FederatedConfigMap"));
        objects.create(&settings()).await.unwrap();

        eventually("pending phase", || phase(&objects) == Some(FederatedPhase::Pending)).await;
        let before = federation.call_count(Verb::Get);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let passes = federation.call_count(Verb::Get) - before;
        assert!(passes >= 20, "{} passes in 5s", passes);
        assert_eq!(controller.queue().num_requeues(&key()), 0);

        stop.cancel();
        controller.join().await;
    }
}
