//! Operator-side controllers.
//!
//! - [`FederatedClusterSource`]: feeds the sync controllers' cluster
//!   registries from `FederatedCluster` objects

mod cluster;

pub use cluster::{kubeconfig_data, FederatedClusterSource};
