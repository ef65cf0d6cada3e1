//! FederatedCluster Custom Resource Definition.
//!
//! Registers a member cluster with the sync controllers.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// FederatedCluster is the Schema for the federatedclusters API.
///
/// Each object names one member cluster and the secret in the host cluster
/// holding its kubeconfig. The cluster name used in placements is the
/// object name.
///
/// # Example
///
/// ```yaml
/// apiVersion: fedsync.io/v1alpha1
/// kind: FederatedCluster
/// metadata:
///   name: us-east
/// spec:
///   secretRef:
///     name: us-east-kubeconfig
///     namespace: fedsync-system
///   labels:
///     region: us-east-1
/// ```
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fedsync.io",
    version = "v1alpha1",
    kind = "FederatedCluster",
    plural = "federatedclusters",
    shortname = "fcl",
    status = "FederatedClusterStatus",
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedClusterSpec {
    /// Secret holding the cluster's kubeconfig.
    pub secret_ref: SecretRef,

    /// Labels exposed through the cluster registry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Health probing for this cluster.
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

/// Reference to a kubeconfig secret.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name.
    pub name: String,

    /// Secret namespace. Defaults to the operator namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Data key holding the kubeconfig.
    #[serde(default = "default_kubeconfig_key")]
    pub key: String,
}

fn default_kubeconfig_key() -> String {
    "kubeconfig".to_string()
}

/// Health probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Interval between probes in seconds.
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u32,

    /// Consecutive failures before the cluster is marked not ready.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_health_interval(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_health_interval() -> u32 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

/// FederatedCluster status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FederatedClusterStatus {
    /// Whether the last probes succeeded.
    #[serde(default)]
    pub ready: bool,

    /// Last status change time (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Last probe or connection error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults() {
        let spec: FederatedClusterSpec =
            serde_json::from_value(serde_json::json!({ "secretRef": { "name": "east" } })).unwrap();
        assert_eq!(spec.secret_ref.key, "kubeconfig");
        assert_eq!(spec.secret_ref.namespace, None);
        assert_eq!(spec.health_check.interval_seconds, 10);
        assert_eq!(spec.health_check.failure_threshold, 3);
        assert!(spec.labels.is_empty());
    }
}
