//! Custom Resource Definitions for the fedsync operator.
//!
//! - [`FederatedCluster`]: a member cluster and its credentials
//! - [`FederatedJob`], [`FederatedConfigMap`], [`FederatedDeployment`]:
//!   federated kinds propagated by the sync controllers

mod cluster;
mod federated;

pub use cluster::{
    FederatedCluster, FederatedClusterSpec, FederatedClusterStatus, HealthCheckConfig, SecretRef,
};
pub use federated::{
    ClusterOverride, ClusterStatus, FederatedConfigMap, FederatedConfigMapSpec,
    FederatedDeployment, FederatedDeploymentSpec, FederatedJob, FederatedJobSpec,
    FederatedResourceStatus, Placement, PropagationCondition,
};

use kube::CustomResourceExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

/// Every CRD the operator relies on.
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        FederatedCluster::crd(),
        FederatedJob::crd(),
        FederatedConfigMap::crd(),
        FederatedDeployment::crd(),
    ]
}
