//! Federated kind Custom Resource Definitions.
//!
//! Every federated kind shares one layout: a template for the target kind,
//! a placement naming member clusters and per-cluster merge-patch overrides.

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema for an embedded manifest the API server must store verbatim.
fn embedded_object(_: &mut SchemaGenerator) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        extensions: [(
            "x-kubernetes-preserve-unknown-fields".to_string(),
            Value::Bool(true),
        )]
        .into_iter()
        .collect(),
        ..Default::default()
    })
}

/// Clusters a federated object is propagated to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    /// Member cluster names.
    #[serde(default)]
    pub cluster_names: Vec<String>,
}

/// A merge patch applied on top of the template for one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOverride {
    /// Member cluster name.
    pub cluster_name: String,

    /// JSON merge patch.
    #[schemars(schema_with = "embedded_object")]
    pub patch: Value,
}

/// Per-cluster entry of a federated status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Member cluster name.
    pub name: String,

    /// Pending, Propagated or Failed.
    pub status: String,

    /// Detail for non-propagated clusters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Propagation condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PropagationCondition {
    /// Condition type.
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown.
    pub status: String,

    /// Machine-readable reason.
    #[serde(default)]
    pub reason: String,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,

    /// Last status change (RFC 3339).
    #[serde(default)]
    pub last_transition_time: String,
}

/// Status written by the sync controller on every federated kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FederatedResourceStatus {
    /// Generation the status was computed for.
    #[serde(default)]
    pub observed_generation: i64,

    /// Propagated, Pending or Failed.
    #[serde(default)]
    pub phase: String,

    /// Per-cluster status, sorted by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterStatus>,

    /// Conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PropagationCondition>,
}

/// FederatedJob propagates a `batch/v1 Job`.
///
/// # Example
///
/// ```yaml
/// apiVersion: fedsync.io/v1alpha1
/// kind: FederatedJob
/// metadata:
///   name: migrate
///   namespace: batch
/// spec:
///   template:
///     spec:
///       parallelism: 1
///       template:
///         spec:
///           restartPolicy: Never
///           containers:
///             - name: migrate
///               image: migrate:1.4
///   placement:
///     clusterNames: [us-east, eu-west]
///   overrides:
///     - clusterName: eu-west
///       patch:
///         spec:
///           parallelism: 3
/// ```
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fedsync.io",
    version = "v1alpha1",
    kind = "FederatedJob",
    plural = "federatedjobs",
    shortname = "fjob",
    namespaced,
    status = "FederatedResourceStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedJobSpec {
    /// Job manifest propagated to every placed cluster.
    #[schemars(schema_with = "embedded_object")]
    pub template: Value,

    /// Target clusters.
    #[serde(default)]
    pub placement: Placement,

    /// Per-cluster overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<ClusterOverride>,
}

/// FederatedConfigMap propagates a `v1 ConfigMap`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fedsync.io",
    version = "v1alpha1",
    kind = "FederatedConfigMap",
    plural = "federatedconfigmaps",
    shortname = "fcm",
    namespaced,
    status = "FederatedResourceStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedConfigMapSpec {
    /// ConfigMap manifest propagated to every placed cluster.
    #[schemars(schema_with = "embedded_object")]
    pub template: Value,

    /// Target clusters.
    #[serde(default)]
    pub placement: Placement,

    /// Per-cluster overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<ClusterOverride>,
}

/// FederatedDeployment propagates an `apps/v1 Deployment`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fedsync.io",
    version = "v1alpha1",
    kind = "FederatedDeployment",
    plural = "federateddeployments",
    shortname = "fdeploy",
    namespaced,
    status = "FederatedResourceStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedDeploymentSpec {
    /// Deployment manifest propagated to every placed cluster.
    #[schemars(schema_with = "embedded_object")]
    pub template: Value,

    /// Target clusters.
    #[serde(default)]
    pub placement: Placement,

    /// Per-cluster overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<ClusterOverride>,
}
