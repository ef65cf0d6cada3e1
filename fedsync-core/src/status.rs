//! Status aggregation.
//!
//! Merges the per-cluster outcomes of one reconcile into the status document
//! written back to the federated object:
//!
//! - The overall phase is `Propagated` only when every desired cluster
//!   reports `Propagated` and no undesired cluster still holds an object.
//! - Any `Failed` cluster makes the phase `Failed`; per-cluster detail is kept.
//! - Clusters whose deletion is confirmed are dropped from the list.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};

/// Condition type written on every federated object.
pub const PROPAGATED_CONDITION: &str = "Propagated";

/// Sync status of one federated object in one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterSyncStatus {
    /// Not yet converged (cluster unreachable or mutation in progress).
    Pending,
    /// The cluster holds an object equivalent to the desired one.
    Propagated,
    /// The cluster could not be converged.
    Failed,
    /// The object was removed from the cluster.
    Deleted,
}

impl std::fmt::Display for ClusterSyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterSyncStatus::Pending => write!(f, "Pending"),
            ClusterSyncStatus::Propagated => write!(f, "Propagated"),
            ClusterSyncStatus::Failed => write!(f, "Failed"),
            ClusterSyncStatus::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Overall phase of a federated object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FederatedPhase {
    /// Every desired cluster converged.
    Propagated,
    /// Convergence still in progress.
    #[default]
    Pending,
    /// At least one cluster failed, or the object itself is invalid.
    Failed,
}

impl std::fmt::Display for FederatedPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FederatedPhase::Propagated => write!(f, "Propagated"),
            FederatedPhase::Pending => write!(f, "Pending"),
            FederatedPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome of one reconcile for one cluster, as produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOutcome {
    /// Cluster name.
    pub cluster: String,
    /// Whether the cluster is in the desired set.
    pub desired: bool,
    /// Resulting status.
    pub status: ClusterSyncStatus,
    /// Failure or progress detail.
    pub message: Option<String>,
    /// A failure that may clear on its own, such as exhausted transient
    /// retries. Always false for other statuses.
    pub retryable: bool,
}

impl ClusterOutcome {
    /// A desired cluster that converged.
    pub fn propagated(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            desired: true,
            status: ClusterSyncStatus::Propagated,
            message: None,
            retryable: false,
        }
    }

    /// A cluster that has not converged yet.
    pub fn pending(cluster: impl Into<String>, desired: bool, message: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            desired,
            status: ClusterSyncStatus::Pending,
            message: Some(message.into()),
            retryable: false,
        }
    }

    /// A cluster that failed and stays failed until something changes.
    pub fn failed(cluster: impl Into<String>, desired: bool, message: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            desired,
            status: ClusterSyncStatus::Failed,
            message: Some(message.into()),
            retryable: false,
        }
    }

    /// A cluster that failed on errors that may clear on retry.
    pub fn failed_retryable(
        cluster: impl Into<String>,
        desired: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            retryable: true,
            ..Self::failed(cluster, desired, message)
        }
    }

    /// An undesired cluster whose object is confirmed gone.
    pub fn deleted(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            desired: false,
            status: ClusterSyncStatus::Deleted,
            message: None,
            retryable: false,
        }
    }
}

/// Per-cluster entry of the status document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusEntry {
    /// Cluster name.
    pub name: String,
    /// Sync status in that cluster.
    pub status: ClusterSyncStatus,
    /// Detail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type.
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    /// Machine-readable reason.
    pub reason: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// RFC 3339 time of the last status change.
    #[serde(default)]
    pub last_transition_time: String,
}

/// Status document of a federated object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedStatus {
    /// Object generation this status describes.
    #[serde(default)]
    pub observed_generation: i64,
    /// Overall phase.
    #[serde(default)]
    pub phase: FederatedPhase,
    /// Per-cluster detail, sorted by cluster name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterStatusEntry>,
    /// Conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl FederatedStatus {
    /// Parse the `status` field of a federated object, if present and valid.
    pub fn from_value(value: Option<&serde_json::Value>) -> Option<Self> {
        value
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// The condition of the given type.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Status of one cluster.
    pub fn cluster(&self, name: &str) -> Option<&ClusterStatusEntry> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// Builds [`FederatedStatus`] documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusAggregator;

impl StatusAggregator {
    /// Merge per-cluster outcomes into a status document.
    ///
    /// `previous` is the status currently stored; its condition transition
    /// time is kept when the condition status does not change, so writing
    /// the result is a no-op when nothing changed.
    pub fn aggregate(
        generation: i64,
        outcomes: &[ClusterOutcome],
        previous: Option<&FederatedStatus>,
    ) -> FederatedStatus {
        let mut clusters: Vec<ClusterStatusEntry> = outcomes
            .iter()
            .filter(|o| o.status != ClusterSyncStatus::Deleted)
            .map(|o| ClusterStatusEntry {
                name: o.cluster.clone(),
                status: o.status,
                message: o.message.clone(),
            })
            .collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));

        let failed = clusters
            .iter()
            .filter(|c| c.status == ClusterSyncStatus::Failed)
            .count();
        let converged = outcomes.iter().all(|o| {
            if o.desired {
                o.status == ClusterSyncStatus::Propagated
            } else {
                o.status == ClusterSyncStatus::Deleted
            }
        });

        let (phase, condition_status, reason, message) = if failed > 0 {
            (
                FederatedPhase::Failed,
                "False",
                "ClusterFailed",
                format!("{} cluster(s) failed", failed),
            )
        } else if converged {
            let desired = outcomes.iter().filter(|o| o.desired).count();
            (
                FederatedPhase::Propagated,
                "True",
                "AllClustersPropagated",
                format!("Propagated to {} cluster(s)", desired),
            )
        } else {
            let pending = clusters
                .iter()
                .filter(|c| c.status == ClusterSyncStatus::Pending)
                .count();
            (
                FederatedPhase::Pending,
                "False",
                "ClustersPending",
                format!("{} cluster(s) pending", pending),
            )
        };

        FederatedStatus {
            observed_generation: generation,
            phase,
            clusters,
            conditions: vec![condition(previous, condition_status, reason, message)],
        }
    }

    /// Status for a federated object that cannot be reconciled at all.
    ///
    /// Per-cluster detail from `previous` is kept so users still see where
    /// the object was propagated before the error.
    pub fn failure(
        generation: i64,
        error: &SyncError,
        previous: Option<&FederatedStatus>,
    ) -> FederatedStatus {
        FederatedStatus {
            observed_generation: generation,
            phase: FederatedPhase::Failed,
            clusters: previous.map(|p| p.clusters.clone()).unwrap_or_default(),
            conditions: vec![condition(
                previous,
                "False",
                error.reason(),
                error.to_string(),
            )],
        }
    }
}

fn condition(
    previous: Option<&FederatedStatus>,
    status: &str,
    reason: &str,
    message: String,
) -> Condition {
    let last_transition_time = previous
        .and_then(|p| p.condition(PROPAGATED_CONDITION))
        .filter(|c| c.status == status && !c.last_transition_time.is_empty())
        .map(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

    Condition {
        type_: PROPAGATED_CONDITION.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time,
    }
}
