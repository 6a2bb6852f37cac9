//! Integration test: locate.
//!
//! Every node answers broadcast locate requests for the blobs it holds.
//! After a rebalance the answer must follow the blob.

use std::time::Duration;

use ballast_coord::keys;
use ballast_integration_tests::{GROUP, TestCluster, object_name, test_data_seeded};

/// Only the node holding a blob answers for it.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_locate_finds_single_holder() {
    let c = TestCluster::new(3).await;
    let name = object_name(7, 0);
    c.node(1).write(&name, &test_data_seeded(64, 7)).await;

    let answers = c.locate_all(&name).await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].address, c.node(1).addr());
    assert_eq!(answers[0].shard, 0);

    assert!(c.locate_all(&object_name(8, 0)).await.is_empty());
}

/// A blob moved by a join is located on the joiner, not its old holder.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_locate_follows_migration() {
    let mut c = TestCluster::new(1).await;
    for i in 0..6 {
        c.node(0)
            .write(&object_name(i, 1), &test_data_seeded(50, i as u32 + 1))
            .await;
    }

    let joiner = c.add_node().await;
    c.node(joiner).service().join().await.unwrap();

    let moved = c.node(joiner).object_names().await;
    assert_eq!(moved.len(), 3);
    for name in &moved {
        let answers = c.locate_all(name).await;
        assert_eq!(answers.len(), 1, "{name}");
        assert_eq!(answers[0].address, c.node(joiner).addr());
    }
    for name in c.node(0).object_names().await {
        let answers = c.locate_all(&name).await;
        assert_eq!(answers.len(), 1, "{name}");
        assert_eq!(answers[0].address, c.node(0).addr());
    }
}

/// Every responder re-subscribes after the coordination store drops its
/// watches.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_locate_survives_watch_loss() {
    let c = TestCluster::new(3).await;
    let name = object_name(3, 2);
    for i in 0..c.len() {
        c.node(i).write(&name, &test_data_seeded(32, 3)).await;
    }
    assert_eq!(c.locate_all(&name).await.len(), 3);

    c.coordinator().drop_watchers();
    let broadcast = keys::locate_broadcast_key(GROUP);
    while c.coordinator().watcher_count(&broadcast) < c.len() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut addresses: Vec<String> = c
        .locate_all(&name)
        .await
        .into_iter()
        .map(|a| a.address)
        .collect();
    addresses.sort();
    let mut expected: Vec<String> = (0..c.len()).map(|i| c.node(i).addr()).collect();
    expected.sort();
    assert_eq!(addresses, expected);
}

/// A stopped responder no longer answers; the others still do.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_stopped_locator_is_silent() {
    let c = TestCluster::new(2).await;
    let name = object_name(5, 0);
    c.node(0).write(&name, &test_data_seeded(16, 5)).await;
    c.node(1).write(&name, &test_data_seeded(16, 5)).await;

    c.stop_locator(0).await;
    let answers = c.locate_all(&name).await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].address, c.node(1).addr());
}
