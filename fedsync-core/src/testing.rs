//! Test harness for running a sync controller against in-process clusters.

use crate::adapter::AdapterRegistry;
use crate::client::ClusterConnection;
use crate::controller::{start_sync_controller, ClusterSource, SyncController};
use crate::error::SyncResult;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A sync controller started in minimal-latency mode, stopped on
/// [`tear_down`](Self::tear_down) or drop.
pub struct ControllerFixture {
    stop: CancellationToken,
    controller: SyncController,
}

impl ControllerFixture {
    /// Start a controller for `kind`.
    pub fn new(
        kind: &str,
        adapters: &AdapterRegistry,
        federation: Arc<dyn ClusterConnection>,
        host: Arc<dyn ClusterConnection>,
        cluster_source: Arc<dyn ClusterSource>,
    ) -> SyncResult<Self> {
        let stop = CancellationToken::new();
        let controller = start_sync_controller(
            kind,
            adapters,
            federation,
            host,
            cluster_source,
            stop.clone(),
            true,
        )?;
        Ok(Self { stop, controller })
    }

    /// The running controller.
    pub fn controller(&self) -> &SyncController {
        &self.controller
    }

    /// Stop the controller and wait for every task to exit.
    pub async fn tear_down(self) {
        self.stop.cancel();
        self.controller.join().await;
    }
}

impl Drop for ControllerFixture {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
