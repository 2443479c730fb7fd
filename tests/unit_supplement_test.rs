// tests/unit_supplement_test.rs

//! Supplement reactor behavior over the in-process store: pool assignment,
//! the single-pool-membership invariant, request-cap enforcement, and
//! idempotency under event redelivery.

#[path = "integration/test_helpers.rs"]
mod test_helpers;

use std::sync::Arc;

use falcon_cm::core::store::{ClusterPaths, CoordStore};
use falcon_cm::core::supplement::SupplementReactorTask;
use falcon_cm::core::types::Group;
use tokio::sync::{broadcast, mpsc};

use test_helpers::{TestCluster, wait_for};

async fn spawn_reactor(cluster: &TestCluster) -> mpsc::Sender<()> {
    let (tick_tx, tick_rx) = mpsc::channel(16);
    let store: Arc<dyn CoordStore> = Arc::new(cluster.session());
    let task = SupplementReactorTask::new(store, ClusterPaths::new("/falcon"), tick_rx);
    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        // Keep the sender alive for the task's lifetime.
        let _shutdown_tx = shutdown_tx;
        task.run(shutdown_rx).await;
    });
    tick_tx
}

#[tokio::test]
async fn test_spare_is_moved_into_depleted_group() {
    let cluster = TestCluster::new().await;
    cluster.seed_group(Group::Dn(0), &["n1", "n2"]).await;
    let admin = cluster.admin();
    admin
        .create(&cluster.paths.supplement(false, "spare1"), b"", false)
        .await
        .unwrap();
    admin
        .create(&cluster.paths.need_supplement(Group::Dn(0), 0), b"", false)
        .await
        .unwrap();

    let tick_tx = spawn_reactor(&cluster).await;
    tick_tx.send(()).await.unwrap();

    wait_for(
        || async {
            admin
                .exists(&cluster.paths.host_node(Group::Dn(0), "spare1"))
                .await
                .unwrap_or(false)
        },
        "the spare to join the roster",
    )
    .await;

    // The fresh member carries the rebuild flag.
    assert_eq!(
        admin
            .get_string(&cluster.paths.host_node(Group::Dn(0), "spare1"))
            .await
            .unwrap(),
        "new"
    );
    // The request is consumed and the pool drained: the node now lives in
    // exactly one place.
    wait_for(
        || async {
            !admin
                .exists(&cluster.paths.need_supplement(Group::Dn(0), 0))
                .await
                .unwrap_or(true)
        },
        "the request to be consumed",
    )
    .await;
    assert!(
        !admin
            .exists(&cluster.paths.supplement(false, "spare1"))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_cn_requests_draw_from_cn_pool() {
    let cluster = TestCluster::new().await;
    cluster.seed_group(Group::Cn, &["n1", "n2"]).await;
    let admin = cluster.admin();
    admin
        .create(&cluster.paths.supplement(true, "cn-spare"), b"", false)
        .await
        .unwrap();
    admin
        .create(&cluster.paths.supplement(false, "dn-spare"), b"", false)
        .await
        .unwrap();
    admin
        .create(&cluster.paths.need_supplement(Group::Cn, 0), b"", false)
        .await
        .unwrap();

    let tick_tx = spawn_reactor(&cluster).await;
    tick_tx.send(()).await.unwrap();

    wait_for(
        || async {
            admin
                .exists(&cluster.paths.host_node(Group::Cn, "cn-spare"))
                .await
                .unwrap_or(false)
        },
        "the CN spare to join the roster",
    )
    .await;
    // The DN pool is untouched.
    assert!(
        admin
            .exists(&cluster.paths.supplement(false, "dn-spare"))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_out_of_contract_requests_are_dropped() {
    let cluster = TestCluster::new().await;
    cluster.seed_group(Group::Dn(0), &["n1", "n2"]).await;
    let admin = cluster.admin();
    admin
        .create(&cluster.paths.supplement(false, "spare1"), b"", false)
        .await
        .unwrap();
    let bogus = format!("{}/dn0-5", cluster.paths.need_supplement_dir());
    admin.create(&bogus, b"", false).await.unwrap();

    let tick_tx = spawn_reactor(&cluster).await;
    tick_tx.send(()).await.unwrap();

    wait_for(
        || async { !admin.exists(&bogus).await.unwrap_or(true) },
        "the out-of-contract request to be dropped",
    )
    .await;
    // No assignment happened; the spare stays pooled.
    assert!(
        admin
            .exists(&cluster.paths.supplement(false, "spare1"))
            .await
            .unwrap()
    );
    let hosts = admin
        .children(&cluster.paths.host_nodes_dir(Group::Dn(0)))
        .await
        .unwrap();
    assert_eq!(hosts.len(), 2);
}

#[tokio::test]
async fn test_redelivered_events_cause_one_assignment() {
    let cluster = TestCluster::new().await;
    cluster.seed_group(Group::Dn(0), &["n1", "n2"]).await;
    let admin = cluster.admin();
    admin
        .create(&cluster.paths.supplement(false, "spare1"), b"", false)
        .await
        .unwrap();
    admin
        .create(&cluster.paths.need_supplement(Group::Dn(0), 0), b"", false)
        .await
        .unwrap();

    let tick_tx = spawn_reactor(&cluster).await;
    // The store redelivers: several ticks for one request.
    tick_tx.send(()).await.unwrap();
    tick_tx.send(()).await.unwrap();
    tick_tx.send(()).await.unwrap();

    wait_for(
        || async {
            admin
                .exists(&cluster.paths.host_node(Group::Dn(0), "spare1"))
                .await
                .unwrap_or(false)
        },
        "the spare to join the roster",
    )
    .await;
    wait_for(
        || async {
            admin
                .children(&cluster.paths.need_supplement_dir())
                .await
                .map(|c| c.is_empty())
                .unwrap_or(false)
        },
        "all requests to drain",
    )
    .await;

    // One assignment: the roster gained exactly the one spare.
    let mut hosts = admin
        .children(&cluster.paths.host_nodes_dir(Group::Dn(0)))
        .await
        .unwrap();
    hosts.sort();
    assert_eq!(hosts, vec!["n1".to_string(), "n2".to_string(), "spare1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_empty_pool_waits_for_a_spare() {
    let cluster = TestCluster::new().await;
    cluster.seed_group(Group::Dn(0), &["n1", "n2"]).await;
    let admin = cluster.admin();
    admin
        .create(&cluster.paths.need_supplement(Group::Dn(0), 0), b"", false)
        .await
        .unwrap();

    let tick_tx = spawn_reactor(&cluster).await;
    tick_tx.send(()).await.unwrap();

    // Let the reactor hit the empty pool at least once.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    admin
        .create(&cluster.paths.supplement(false, "late-spare"), b"", false)
        .await
        .unwrap();

    wait_for(
        || async {
            admin
                .exists(&cluster.paths.host_node(Group::Dn(0), "late-spare"))
                .await
                .unwrap_or(false)
        },
        "the late spare to join the roster",
    )
    .await;
}
