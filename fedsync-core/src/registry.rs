//! Member cluster registry.
//!
//! Tracks the registered member clusters, their live connections and their
//! readiness. Read-mostly and internally synchronized; registration changes
//! are published as [`ClusterEvent`]s so the change feed and the engine pick
//! them up without restarting.

use crate::client::ClusterConnection;
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Capacity of the registry event channel.
const EVENT_CAPACITY: usize = 256;

/// A change in the set of member clusters or their readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A cluster was registered (or its connection replaced).
    Registered(String),
    /// A cluster was removed.
    Deregistered(String),
    /// A cluster became ready.
    Ready(String),
    /// A cluster became unreachable.
    NotReady(String),
}

impl ClusterEvent {
    /// Name of the cluster the event concerns.
    pub fn cluster(&self) -> &str {
        match self {
            ClusterEvent::Registered(name)
            | ClusterEvent::Deregistered(name)
            | ClusterEvent::Ready(name)
            | ClusterEvent::NotReady(name) => name,
        }
    }
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    /// Cluster name.
    pub name: String,
    /// Whether the cluster currently answers calls.
    pub ready: bool,
    /// Labels attached at registration.
    pub labels: BTreeMap<String, String>,
}

struct ClusterEntry {
    connection: Arc<dyn ClusterConnection>,
    ready: bool,
    labels: BTreeMap<String, String>,
}

/// Registry of member clusters.
pub struct ClusterRegistry {
    clusters: RwLock<BTreeMap<String, ClusterEntry>>,
    events: broadcast::Sender<ClusterEvent>,
    synced: watch::Sender<bool>,
}

impl fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("clusters", &self.snapshot())
            .finish()
    }
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (synced, _) = watch::channel(false);
        Self {
            clusters: RwLock::new(BTreeMap::new()),
            events,
            synced,
        }
    }

    /// Names of all registered clusters, in stable (sorted) order.
    pub fn clusters(&self) -> Vec<String> {
        self.clusters.read().keys().cloned().collect()
    }

    /// Names of the registered clusters that are ready, in sorted order.
    pub fn ready_clusters(&self) -> Vec<String> {
        self.clusters
            .read()
            .iter()
            .filter(|(_, entry)| entry.ready)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Connection to a registered cluster.
    ///
    /// # Errors
    ///
    /// `UnknownCluster` when no cluster with that name is registered.
    pub fn client_for(&self, name: &str) -> SyncResult<Arc<dyn ClusterConnection>> {
        self.clusters
            .read()
            .get(name)
            .map(|entry| Arc::clone(&entry.connection))
            .ok_or_else(|| SyncError::UnknownCluster(name.to_string()))
    }

    /// Whether the cluster is registered and ready.
    pub fn is_ready(&self, name: &str) -> bool {
        self.clusters
            .read()
            .get(name)
            .is_some_and(|entry| entry.ready)
    }

    /// Whether the cluster is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.clusters.read().contains_key(name)
    }

    /// Labels of a registered cluster.
    pub fn labels(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.clusters
            .read()
            .get(name)
            .map(|entry| entry.labels.clone())
    }

    /// Snapshot of every entry, in sorted order.
    pub fn snapshot(&self) -> Vec<ClusterInfo> {
        self.clusters
            .read()
            .iter()
            .map(|(name, entry)| ClusterInfo {
                name: name.clone(),
                ready: entry.ready,
                labels: entry.labels.clone(),
            })
            .collect()
    }

    /// Register a cluster, replacing any existing entry with the same name.
    /// New entries start ready.
    pub fn register(
        &self,
        name: impl Into<String>,
        connection: Arc<dyn ClusterConnection>,
        labels: BTreeMap<String, String>,
    ) {
        let name = name.into();
        self.clusters.write().insert(
            name.clone(),
            ClusterEntry {
                connection,
                ready: true,
                labels,
            },
        );
        tracing::info!(cluster = %name, "Registered member cluster");
        self.publish(ClusterEvent::Registered(name));
    }

    /// Remove a cluster. Returns false if it was not registered.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.clusters.write().remove(name).is_some();
        if removed {
            tracing::info!(cluster = %name, "Deregistered member cluster");
            self.publish(ClusterEvent::Deregistered(name.to_string()));
        }
        removed
    }

    /// Update readiness. Publishes an event only on a transition.
    pub fn set_ready(&self, name: &str, ready: bool) {
        let changed = {
            let mut clusters = self.clusters.write();
            match clusters.get_mut(name) {
                Some(entry) if entry.ready != ready => {
                    entry.ready = ready;
                    true
                }
                _ => false,
            }
        };

        if changed {
            if ready {
                tracing::info!(cluster = %name, "Member cluster became ready");
                self.publish(ClusterEvent::Ready(name.to_string()));
            } else {
                tracing::warn!(cluster = %name, "Member cluster became unreachable");
                self.publish(ClusterEvent::NotReady(name.to_string()));
            }
        }
    }

    /// Mark the initial cluster listing as complete.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Whether the initial cluster listing is complete.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial cluster listing is complete.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as the registry, so this cannot fail.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ClusterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;

    fn registry_with(names: &[&str]) -> ClusterRegistry {
        let registry = ClusterRegistry::new();
        for name in names {
            registry.register(*name, Arc::new(MemoryCluster::new(*name)), BTreeMap::new());
        }
        registry
    }

    #[test]
    fn clusters_are_sorted() {
        let registry = registry_with(&["b", "c", "a"]);
        assert_eq!(registry.clusters(), vec!["a", "b", "c"]);
    }

    #[test]
    fn client_for_unknown_cluster() {
        let registry = registry_with(&["a"]);
        assert!(registry.client_for("a").is_ok());
        assert!(matches!(
            registry.client_for("z"),
            Err(SyncError::UnknownCluster(name)) if name == "z"
        ));
    }

    #[test]
    fn readiness_transitions_publish_events() {
        let registry = registry_with(&["a"]);
        let mut events = registry.subscribe();

        registry.set_ready("a", true);
        assert!(events.try_recv().is_err(), "no event without a transition");

        registry.set_ready("a", false);
        assert!(!registry.is_ready("a"));
        assert_eq!(registry.ready_clusters(), Vec::<String>::new());
        assert_eq!(events.try_recv().unwrap(), ClusterEvent::NotReady("a".into()));

        registry.set_ready("a", true);
        assert_eq!(events.try_recv().unwrap(), ClusterEvent::Ready("a".into()));
    }

    #[test]
    fn deregister_removes_entry() {
        let registry = registry_with(&["a", "b"]);
        let mut events = registry.subscribe();

        assert!(registry.deregister("a"));
        assert!(!registry.deregister("a"));
        assert_eq!(registry.clusters(), vec!["b"]);
        assert!(!registry.is_ready("a"));
        assert_eq!(
            events.try_recv().unwrap(),
            ClusterEvent::Deregistered("a".into())
        );
    }

    #[tokio::test]
    async fn wait_synced_returns_after_mark() {
        let registry = Arc::new(ClusterRegistry::new());
        assert!(!registry.is_synced());
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_synced().await })
        };
        registry.mark_synced();
        waiter.await.unwrap();
        assert!(registry.is_synced());
    }

    #[test]
    fn labels_are_kept() {
        let registry = ClusterRegistry::new();
        let labels: BTreeMap<_, _> = [("region".to_string(), "eu".to_string())].into();
        registry.register("a", Arc::new(MemoryCluster::new("a")), labels.clone());
        assert_eq!(registry.labels("a"), Some(labels));
        assert_eq!(registry.labels("b"), None);
    }
}
