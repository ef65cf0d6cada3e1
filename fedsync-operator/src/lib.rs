//! fedsync Kubernetes operator
//!
//! Runs fedsync sync controllers against real API servers.
//!
//! # Custom Resource Definitions
//!
//! - **FederatedCluster**: a member cluster and the secret holding its kubeconfig
//! - **FederatedJob**, **FederatedConfigMap**, **FederatedDeployment**: templates
//!   propagated to member clusters
//!
//! # Example
//!
//! ```yaml
//! apiVersion: fedsync.io/v1alpha1
//! kind: FederatedConfigMap
//! metadata:
//!   name: settings
//!   namespace: web
//! spec:
//!   template:
//!     data:
//!       mode: active
//!   placement:
//!     clusterNames: [us-east, eu-west]
//!   overrides:
//!     - clusterName: eu-west
//!       patch:
//!         data:
//!           mode: standby
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod controller;
pub mod crd;
pub mod error;

pub use client::KubeConnection;
pub use controller::FederatedClusterSource;
pub use crd::{FederatedCluster, FederatedConfigMap, FederatedDeployment, FederatedJob};
pub use error::{OperatorError, OperatorResult};
