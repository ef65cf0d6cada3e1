//! Prelude for convenient imports.
//!
//! ```ignore
//! use fedsync_core::prelude::*;
//! ```

// Adapters
pub use crate::adapter::{
    federated_resource, Adapter, AdapterFactory, AdapterRegistry, EquivalencePolicy,
    TemplateAdapter,
};

// Cluster access
pub use crate::client::{
    to_manifest, to_object, ClientFuture, ClusterConnection, ListOptions, ObjectList, PatchType,
    ResourceClient, WatchEvent, WatchStream,
};
pub use crate::memory::{Fault, MemoryCluster, MemoryResourceClient, Verb};
pub use crate::registry::{ClusterEvent, ClusterInfo, ClusterRegistry};

// Controller
pub use crate::config::SyncControllerConfig;
pub use crate::controller::{
    start_sync_controller, start_sync_controller_with_config, ClusterSource, ControllerHealth,
    ControllerManager, StaticClusterSource, SyncController,
};
pub use crate::engine::{ClusterAction, ReconcileAction, SyncEngine};
pub use crate::testing::ControllerFixture;

// Errors and status
pub use crate::error::{SyncError, SyncResult};
pub use crate::object::ObjectKey;
pub use crate::status::{
    ClusterOutcome, ClusterSyncStatus, Condition, FederatedPhase, FederatedStatus,
    StatusAggregator,
};
