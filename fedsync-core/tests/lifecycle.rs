//! Deletion, invalid objects, watch recovery and controller lifecycle.

mod common;

use common::*;
use fedsync_core::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONFIG_MAP: &str = "FederatedConfigMap";

async fn converged(env: &TestFederation, name: &str, clusters: &[&str]) -> bool {
    let federated = env.federated(CONFIG_MAP);
    let expected: Vec<_> = clusters
        .iter()
        .map(|c| (*c, ClusterSyncStatus::Propagated))
        .collect();
    wait_for(3000, || {
        status_is(&federated, name, FederatedPhase::Propagated, &expected)
    })
    .await
}

async fn queue_drained(controller: &SyncController) -> bool {
    wait_for(3000, || {
        controller.queue().is_empty() && controller.queue().in_flight() == 0
    })
    .await
}

/// Deleting a federated object removes the concrete object everywhere,
/// releases the finalizer and leaves nothing queued.
#[tokio::test]
async fn test_delete_cleans_up_every_cluster() {
    let env = TestFederation::new(&["a", "b"]);
    let fixture = env.start(CONFIG_MAP);
    let federated = env.federated(CONFIG_MAP);
    let target = config_map_resource();

    federated
        .create(&federated_config_map("settings", json!({ "mode": "fast" }), &["a", "b"]))
        .await
        .unwrap();
    assert!(converged(&env, "settings", &["a", "b"]).await);

    federated.delete(&key("settings")).await.unwrap();

    assert!(
        wait_for(3000, || federated.peek(&key("settings")).is_none()).await,
        "Finalizer was never released"
    );
    for cluster in ["a", "b"] {
        assert!(env.member(cluster, &target).peek(&key("settings")).is_none());
    }

    let controller = fixture.controller();
    assert!(queue_drained(controller).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(controller.queue().is_empty(), "Key was re-enqueued after deletion");
    assert_eq!(controller.engine().last_known_placement(&key("settings")), None);

    fixture.tear_down().await;
}

/// Without finalizers the federated object vanishes at once and the
/// controller still sweeps the member clusters.
#[tokio::test]
async fn test_delete_without_finalizers() {
    let env = TestFederation::new(&["a", "b"]);
    let config = SyncControllerConfig::builder()
        .use_finalizers(false)
        .minimize_latency(true)
        .build()
        .unwrap();
    let stop = CancellationToken::new();
    let controller = start_sync_controller_with_config(
        CONFIG_MAP,
        &AdapterRegistry::with_builtin(),
        Arc::new(env.federation.clone()),
        Arc::new(env.host.clone()),
        env.source(),
        stop.clone(),
        config,
    )
    .unwrap();
    let federated = env.federated(CONFIG_MAP);
    let target = config_map_resource();

    federated
        .create(&federated_config_map("settings", json!({ "mode": "fast" }), &["a", "b"]))
        .await
        .unwrap();
    assert!(converged(&env, "settings", &["a", "b"]).await);
    assert!(federated
        .peek(&key("settings"))
        .unwrap()
        .metadata
        .finalizers
        .unwrap_or_default()
        .is_empty());

    federated.delete(&key("settings")).await.unwrap();
    assert!(federated.peek(&key("settings")).is_none());

    assert!(
        wait_for(3000, || {
            ["a", "b"]
                .iter()
                .all(|c| env.member(c, &target).peek(&key("settings")).is_none())
        })
        .await
    );
    assert!(queue_drained(&controller).await);

    stop.cancel();
    controller.join().await;
}

/// A placement naming an unregistered cluster is a permanent error: nothing
/// is created, the status says why, and fixing the placement recovers.
#[tokio::test]
async fn test_unknown_cluster_fails_the_object() {
    let env = TestFederation::new(&["a"]);
    let fixture = env.start(CONFIG_MAP);
    let federated = env.federated(CONFIG_MAP);
    let target = config_map_resource();

    federated
        .create(&federated_config_map("settings", json!({ "mode": "fast" }), &["a", "z"]))
        .await
        .unwrap();

    assert!(
        wait_for(3000, || {
            status_of(&federated, "settings").is_some_and(|s| {
                s.phase == FederatedPhase::Failed
                    && s.condition("Propagated")
                        .is_some_and(|c| c.reason == "UnknownCluster")
            })
        })
        .await
    );
    assert!(env.member("a", &target).peek(&key("settings")).is_none());

    let patch = json!({ "spec": { "placement": { "clusterNames": ["a"] } } });
    let k = key("settings");
    with_conflict_retry(|| federated.patch(&k, PatchType::Merge, &patch)).await;
    assert!(converged(&env, "settings", &["a"]).await);

    fixture.tear_down().await;
}

/// A federated object without a template is reported invalid.
#[tokio::test]
async fn test_missing_template_fails_the_object() {
    let env = TestFederation::new(&["a"]);
    let fixture = env.start(CONFIG_MAP);
    let federated = env.federated(CONFIG_MAP);

    let obj = to_object(json!({
        "apiVersion": "fedsync.io/v1alpha1",
        "kind": "FederatedConfigMap",
        "metadata": { "name": "broken", "namespace": NAMESPACE },
        "spec": { "placement": { "clusterNames": ["a"] } }
    }))
    .unwrap();
    federated.create(&obj).await.unwrap();

    assert!(
        wait_for(3000, || {
            status_of(&federated, "broken").is_some_and(|s| {
                s.phase == FederatedPhase::Failed
                    && s.condition("Propagated")
                        .is_some_and(|c| c.reason == "InvalidTemplate")
            })
        })
        .await
    );
    assert_eq!(env.cluster("a").mutation_count(), 0);

    fixture.tear_down().await;
}

/// Changes made while the federation watch is down are picked up by the
/// relist.
#[tokio::test]
async fn test_federation_watch_catches_up() {
    let env = TestFederation::new(&["a"]);
    let fixture = env.start(CONFIG_MAP);
    let federated = env.federated(CONFIG_MAP);
    let target = config_map_resource();

    federated
        .create(&federated_config_map("settings", json!({ "mode": "fast" }), &["a"]))
        .await
        .unwrap();
    assert!(converged(&env, "settings", &["a"]).await);

    env.federation.disconnect_watches();
    let patch = json!({ "spec": { "template": { "data": { "mode": "safe" } } } });
    let k = key("settings");
    with_conflict_retry(|| federated.patch(&k, PatchType::Merge, &patch)).await;

    let member = env.member("a", &target);
    assert!(
        wait_for(3000, || {
            member
                .peek(&k)
                .is_some_and(|obj| obj.data["data"] == json!({ "mode": "safe" }))
        })
        .await,
        "Template change was lost"
    );

    fixture.tear_down().await;
}

/// Out-of-band edits and deletions in a member cluster are reverted.
#[tokio::test]
async fn test_member_drift_is_repaired() {
    let env = TestFederation::new(&["a"]);
    let fixture = env.start(CONFIG_MAP);
    let federated = env.federated(CONFIG_MAP);
    let member = env.member("a", &config_map_resource());
    let k = key("settings");

    federated
        .create(&federated_config_map("settings", json!({ "mode": "fast" }), &["a"]))
        .await
        .unwrap();
    assert!(converged(&env, "settings", &["a"]).await);

    let mut edited = member.peek(&k).unwrap();
    edited.data["data"] = json!({ "mode": "tampered" });
    member.update(&edited).await.unwrap();
    assert!(
        wait_for(3000, || {
            member
                .peek(&k)
                .is_some_and(|obj| obj.data["data"] == json!({ "mode": "fast" }))
        })
        .await,
        "Edit was not reverted"
    );

    member.delete(&k).await.unwrap();
    assert!(
        wait_for(3000, || member.peek(&k).is_some()).await,
        "Deleted object was not recreated"
    );

    fixture.tear_down().await;
}

/// Losing the federation plane is reported on the health channel and the
/// controller recovers on its own.
#[tokio::test]
async fn test_federation_outage_is_reported() {
    let env = TestFederation::new(&["a"]);
    let fixture = env.start(CONFIG_MAP);
    let health = fixture.controller().health();

    assert!(wait_for(3000, || health.borrow().federation_reachable).await);

    env.federation.set_reachable(false);
    assert!(
        wait_for(3000, || {
            let h = health.borrow();
            !h.federation_reachable && h.last_error.is_some()
        })
        .await
    );

    env.federation.set_reachable(true);
    assert!(wait_for(3000, || health.borrow().federation_reachable).await);
    assert_eq!(health.borrow().last_error, None);

    let federated = env.federated(CONFIG_MAP);
    federated
        .create(&federated_config_map("settings", json!({ "mode": "fast" }), &["a"]))
        .await
        .unwrap();
    assert!(converged(&env, "settings", &["a"]).await);

    fixture.tear_down().await;
}

/// Two kinds run side by side under one manager; the same kind cannot be
/// started twice.
#[tokio::test]
async fn test_manager_runs_kinds_side_by_side() {
    let env = TestFederation::new(&["a"]);
    let manager = ControllerManager::new(
        AdapterRegistry::with_builtin(),
        Arc::new(env.federation.clone()),
        Arc::new(env.host.clone()),
        env.source(),
        SyncControllerConfig::default().minimize_latency(),
    );

    manager.start(CONFIG_MAP).unwrap();
    manager.start("FederatedJob").unwrap();
    assert!(matches!(
        manager.start(CONFIG_MAP),
        Err(SyncError::AlreadyRunning(_))
    ));
    assert_eq!(manager.running_kinds(), vec!["FederatedConfigMap", "FederatedJob"]);

    env.federated(CONFIG_MAP)
        .create(&federated_config_map("settings", json!({ "mode": "fast" }), &["a"]))
        .await
        .unwrap();
    assert!(converged(&env, "settings", &["a"]).await);

    assert!(manager.stop("FederatedJob").await);
    assert_eq!(manager.running_kinds(), vec!["FederatedConfigMap"]);

    manager.shutdown().await;
    assert!(manager.running_kinds().is_empty());
}
