//! Change feed.
//!
//! Turns watch events from the federation plane and from every member
//! cluster into work queue keys. Event payloads are never handed to the
//! engine: it re-reads current state at reconcile time.
//!
//! Each watch is list-then-watch. When a watch drops, the feed relists
//! before watching again and enqueues every key that changed or vanished
//! during the gap.

use crate::client::{ListOptions, ResourceClient, WatchEvent};
use crate::config::SyncControllerConfig;
use crate::controller::ControllerHealth;
use crate::error::SyncResult;
use crate::object::{
    generation, is_being_deleted, managed_selector, ObjectKey, FEDERATED_KIND_ANNOTATION,
};
use crate::queue::WorkQueue;
use crate::registry::{ClusterEvent, ClusterRegistry};
use crate::retry::{jittered, RetryConfig};
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Change-detection fingerprint of an object. Status-only changes leave it
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    generation: i64,
    deleting: bool,
    labels: std::collections::BTreeMap<String, String>,
    annotations: std::collections::BTreeMap<String, String>,
    finalizers: Vec<String>,
}

impl Fingerprint {
    fn of(obj: &DynamicObject) -> Self {
        Self {
            generation: generation(obj),
            deleting: is_being_deleted(obj),
            labels: obj.labels().clone(),
            annotations: obj.annotations().clone(),
            finalizers: obj.finalizers().to_vec(),
        }
    }
}

/// What a watch loop does with the objects it sees.
trait WatchHandler: Send {
    /// A full list replaced the previous view.
    fn relisted(&mut self, items: &[DynamicObject]);
    /// One incremental event.
    fn event(&mut self, event: &WatchEvent);
    /// The list call succeeded or failed.
    fn reachable(&mut self, _result: &SyncResult<()>) {}
}

/// Federated-object handler: enqueues on spec, metadata or deletion
/// changes, skipping status-only updates.
struct FederationHandler {
    queue: WorkQueue<ObjectKey>,
    known: Arc<Mutex<HashMap<ObjectKey, Fingerprint>>>,
    health: Arc<watch::Sender<ControllerHealth>>,
}

impl WatchHandler for FederationHandler {
    fn relisted(&mut self, items: &[DynamicObject]) {
        let listed: HashMap<ObjectKey, Fingerprint> = items
            .iter()
            .map(|obj| (ObjectKey::of(obj), Fingerprint::of(obj)))
            .collect();

        let mut known = self.known.lock();
        for key in known.keys().filter(|k| !listed.contains_key(*k)) {
            self.queue.add(key.clone());
        }
        // Every listed object is reconciled after a relist; that is the
        // catch-up for events missed while the watch was down.
        for key in listed.keys() {
            self.queue.add(key.clone());
        }
        *known = listed;
    }

    fn event(&mut self, event: &WatchEvent) {
        let mut known = self.known.lock();
        match event {
            WatchEvent::Added(obj) => {
                let key = ObjectKey::of(obj);
                known.insert(key.clone(), Fingerprint::of(obj));
                self.queue.add(key);
            }
            WatchEvent::Modified(obj) => {
                let key = ObjectKey::of(obj);
                let fingerprint = Fingerprint::of(obj);
                if known.get(&key) != Some(&fingerprint) {
                    known.insert(key.clone(), fingerprint);
                    self.queue.add(key);
                } else {
                    tracing::trace!(key = %key, "Ignoring status-only change");
                }
            }
            WatchEvent::Deleted(obj) => {
                let key = ObjectKey::of(obj);
                known.remove(&key);
                self.queue.add(key);
            }
            WatchEvent::Bookmark(_) => {}
        }
    }

    fn reachable(&mut self, result: &SyncResult<()>) {
        let (reachable, last_error) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        self.health.send_if_modified(|health| {
            let changed = health.federation_reachable != reachable || health.last_error != last_error;
            health.federation_reachable = reachable;
            health.last_error = last_error;
            changed
        });
    }
}

/// Member-cluster handler: maps managed concrete objects back to the key of
/// the federated object that owns them.
struct MemberHandler {
    cluster: String,
    kind: String,
    queue: WorkQueue<ObjectKey>,
    known: HashMap<ObjectKey, Fingerprint>,
}

impl MemberHandler {
    fn owned(&self, obj: &DynamicObject) -> bool {
        obj.annotations()
            .get(FEDERATED_KIND_ANNOTATION)
            .is_some_and(|k| k == &self.kind)
    }
}

impl WatchHandler for MemberHandler {
    fn relisted(&mut self, items: &[DynamicObject]) {
        let listed: HashMap<ObjectKey, Fingerprint> = items
            .iter()
            .filter(|obj| self.owned(obj))
            .map(|obj| (ObjectKey::of(obj), Fingerprint::of(obj)))
            .collect();

        for (key, fingerprint) in &listed {
            if self.known.get(key) != Some(fingerprint) {
                self.queue.add(key.clone());
            }
        }
        for key in self.known.keys().filter(|k| !listed.contains_key(*k)) {
            tracing::debug!(cluster = %self.cluster, key = %key, "Managed object vanished while watch was down");
            self.queue.add(key.clone());
        }
        self.known = listed;
    }

    fn event(&mut self, event: &WatchEvent) {
        let Some(obj) = event.object() else {
            return;
        };
        if !self.owned(obj) {
            return;
        }
        let key = ObjectKey::of(obj);
        match event {
            WatchEvent::Deleted(_) => {
                self.known.remove(&key);
                self.queue.add(key);
            }
            _ => {
                let fingerprint = Fingerprint::of(obj);
                if self.known.get(&key) != Some(&fingerprint) {
                    self.known.insert(key.clone(), fingerprint);
                    self.queue.add(key);
                }
            }
        }
    }
}

/// List-then-watch until `stop` fires, relisting with backoff whenever the
/// watch drops.
async fn run_watch(
    name: String,
    client: Arc<dyn ResourceClient>,
    options: ListOptions,
    mut handler: impl WatchHandler,
    backoff: RetryConfig,
    stop: CancellationToken,
) {
    let mut failures = 0u32;

    while !stop.is_cancelled() {
        if failures > 0 {
            let delay = jittered(backoff.delay_for(failures));
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let list = match client.list(&options).await {
            Ok(list) => {
                handler.reachable(&Ok(()));
                list
            }
            Err(e) => {
                tracing::warn!(watch = %name, error = %e, "List failed");
                handler.reachable(&Err(e));
                failures = failures.saturating_add(1);
                continue;
            }
        };
        handler.relisted(&list.items);

        let mut stream = match client.watch(&options, &list.resource_version).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(watch = %name, error = %e, "Watch failed to start");
                failures = failures.saturating_add(1);
                continue;
            }
        };
        tracing::debug!(watch = %name, resource_version = %list.resource_version, "Watching");
        failures = 0;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                next = stream.next() => match next {
                    Some(Ok(event)) => handler.event(&event),
                    Some(Err(e)) => {
                        tracing::warn!(watch = %name, error = %e, "Watch dropped, relisting");
                        failures = 1;
                        break;
                    }
                    None => {
                        tracing::debug!(watch = %name, "Watch ended, relisting");
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(watch = %name, "Watch stopped");
}

/// Watches the federation plane and every registered member cluster and
/// feeds the work queue.
pub struct ChangeFeed {
    kind: String,
    federation: Arc<dyn ResourceClient>,
    target: ApiResource,
    registry: Arc<ClusterRegistry>,
    queue: WorkQueue<ObjectKey>,
    config: SyncControllerConfig,
    known: Arc<Mutex<HashMap<ObjectKey, Fingerprint>>>,
    health: Arc<watch::Sender<ControllerHealth>>,
}

impl ChangeFeed {
    /// Create a feed for one federated kind.
    pub fn new(
        kind: impl Into<String>,
        federation: Arc<dyn ResourceClient>,
        target: ApiResource,
        registry: Arc<ClusterRegistry>,
        queue: WorkQueue<ObjectKey>,
        config: SyncControllerConfig,
        health: watch::Sender<ControllerHealth>,
    ) -> Self {
        Self {
            kind: kind.into(),
            federation,
            target,
            registry,
            queue,
            config,
            known: Arc::new(Mutex::new(HashMap::new())),
            health: Arc::new(health),
        }
    }

    /// Keys of every federated object seen on the federation plane.
    pub fn known_keys(&self) -> BTreeSet<ObjectKey> {
        self.known.lock().keys().cloned().collect()
    }

    /// Run every watch until `stop` fires.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let options = match &self.config.namespace {
            Some(ns) => ListOptions::all().within(ns.clone()),
            None => ListOptions::all(),
        };

        let federation = tokio::spawn(run_watch(
            format!("federation/{}", self.kind),
            Arc::clone(&self.federation),
            options,
            FederationHandler {
                queue: self.queue.clone(),
                known: Arc::clone(&self.known),
                health: Arc::clone(&self.health),
            },
            self.config.watch_backoff(),
            stop.clone(),
        ));

        let feed = Arc::clone(&self);
        let members = tokio::spawn(async move { feed.supervise_members(stop).await });

        let _ = federation.await;
        let _ = members.await;
        tracing::info!(kind = %self.kind, "Change feed stopped");
    }

    /// Start and stop member watches as clusters come and go, and requeue
    /// every object when cluster availability changes.
    async fn supervise_members(&self, stop: CancellationToken) {
        let mut events = self.registry.subscribe();
        let mut watches: HashMap<String, CancellationToken> = HashMap::new();

        for cluster in self.registry.clusters() {
            self.start_member_watch(&mut watches, &cluster, &stop);
        }

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(ClusterEvent::Registered(cluster)) => {
                    self.start_member_watch(&mut watches, &cluster, &stop);
                    self.requeue_all(self.config.cluster_available_delay());
                }
                Ok(ClusterEvent::Deregistered(cluster)) => {
                    if let Some(token) = watches.remove(&cluster) {
                        token.cancel();
                    }
                    self.requeue_all(self.config.cluster_unavailable_delay());
                }
                Ok(ClusterEvent::Ready(_)) => {
                    self.requeue_all(self.config.cluster_available_delay());
                }
                Ok(ClusterEvent::NotReady(_)) => {
                    self.requeue_all(self.config.cluster_unavailable_delay());
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(kind = %self.kind, missed = missed, "Missed cluster events, resyncing member watches");
                    let registered: BTreeSet<String> = self.registry.clusters().into_iter().collect();
                    watches.retain(|name, token| {
                        let keep = registered.contains(name);
                        if !keep {
                            token.cancel();
                        }
                        keep
                    });
                    for cluster in &registered {
                        if !watches.contains_key(cluster) {
                            self.start_member_watch(&mut watches, cluster, &stop);
                        }
                    }
                    self.requeue_all(self.config.cluster_available_delay());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        for token in watches.values() {
            token.cancel();
        }
    }

    fn start_member_watch(
        &self,
        watches: &mut HashMap<String, CancellationToken>,
        cluster: &str,
        stop: &CancellationToken,
    ) {
        let connection = match self.registry.client_for(cluster) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::debug!(cluster = %cluster, error = %e, "Cluster gone before watch start");
                return;
            }
        };

        if let Some(previous) = watches.remove(cluster) {
            previous.cancel();
        }
        let token = stop.child_token();
        watches.insert(cluster.to_string(), token.clone());

        tracing::debug!(kind = %self.kind, cluster = %cluster, "Starting member watch");
        tokio::spawn(run_watch(
            format!("{}/{}", cluster, self.target.kind),
            connection.resource_client(&self.target),
            ListOptions::all().labels(managed_selector()),
            MemberHandler {
                cluster: cluster.to_string(),
                kind: self.kind.clone(),
                queue: self.queue.clone(),
                known: HashMap::new(),
            },
            self.config.watch_backoff(),
            token,
        ));
    }

    fn requeue_all(&self, delay: Duration) {
        let keys = self.known_keys();
        tracing::debug!(kind = %self.kind, count = keys.len(), delay_ms = delay.as_millis() as u64, "Requeueing all objects");
        for key in keys {
            self.queue.add_after(key, delay);
        }
    }
}
