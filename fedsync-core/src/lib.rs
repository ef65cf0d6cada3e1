//! fedsync core library
//!
//! Keeps one federated resource kind in sync across a set of member
//! clusters. A federated object on the federation plane carries a template,
//! a placement and per-cluster overrides; the sync controller materializes
//! the template in every placed cluster, removes it everywhere else and
//! writes an aggregated status back.
//!
//! # Key Components
//!
//! - **Adapter**: per-kind knowledge (template, overrides, placement, equivalence)
//! - **Registry**: member clusters, their connections and their readiness
//! - **Feed**: watches on the federation plane and member clusters, feeding a work queue
//! - **Engine**: level-triggered reconcile of one federated object
//! - **Status**: aggregation of per-cluster outcomes
//!
//! # Example
//!
//! ```ignore
//! use fedsync_core::prelude::*;
//!
//! let source = StaticClusterSource::new()
//!     .with_cluster("us-east", Arc::new(MemoryCluster::new("us-east")));
//! let controller = start_sync_controller(
//!     "FederatedJob",
//!     &AdapterRegistry::with_builtin(),
//!     federation,
//!     host,
//!     Arc::new(source),
//!     stop.clone(),
//!     false,
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod client;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod feed;
pub mod memory;
pub mod object;
pub mod prelude;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod status;
pub mod testing;

pub use adapter::{Adapter, AdapterFactory, AdapterRegistry, EquivalencePolicy, TemplateAdapter};
pub use client::{ClusterConnection, ListOptions, ResourceClient, WatchEvent};
pub use config::SyncControllerConfig;
pub use controller::{
    start_sync_controller, start_sync_controller_with_config, ClusterSource, ControllerHealth,
    ControllerManager, StaticClusterSource, SyncController,
};
pub use engine::{ReconcileAction, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use object::ObjectKey;
pub use registry::{ClusterEvent, ClusterRegistry};
pub use status::{ClusterSyncStatus, FederatedPhase, FederatedStatus, StatusAggregator};
