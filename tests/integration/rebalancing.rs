//! Integration test: rebalancing.
//!
//! Nodes join and leave a populated cluster. Totals must be conserved,
//! every blob must live on exactly one node with its bytes intact, and
//! metadata must follow the blobs that moved.

use std::collections::BTreeMap;
use std::time::Duration;

use ballast_coord::{Coordinator, keys};
use ballast_integration_tests::{GROUP, TestCluster, object_name, test_data_seeded};
use ballast_migrate::MigrateError;

const OBJECT_SIZE: usize = 100;

/// Write `count` objects to node `writer`, returning name → contents.
async fn populate(
    c: &TestCluster,
    writer: usize,
    first: usize,
    count: usize,
) -> BTreeMap<String, Vec<u8>> {
    let mut objects = BTreeMap::new();
    for i in first..first + count {
        let name = object_name(i, i % 3);
        let data = test_data_seeded(OBJECT_SIZE, i as u32 + 1);
        c.node(writer).write(&name, &data).await;
        objects.insert(name, data);
    }
    objects
}

/// Assert every object is on exactly one node and reads back intact.
async fn assert_single_copies(c: &TestCluster, objects: &BTreeMap<String, Vec<u8>>) {
    let holders = c.holders().await;
    assert_eq!(holders.len(), objects.len(), "unexpected object count");
    for (name, expected) in objects {
        let nodes = &holders[name];
        assert_eq!(nodes.len(), 1, "{name} held by {nodes:?}");
        let got = c.node(nodes[0]).read(name).await.unwrap();
        assert_eq!(&got[..], &expected[..], "{name} corrupted in transit");
    }
}

/// 3 nodes holding 3000/1000/0 bytes; a fourth joins.
/// avg = ceil(4000 / 4) = 1000, so only node 0 sheds, 2000 bytes.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_join_pulls_surplus_from_heavy_nodes() {
    let mut c = TestCluster::new(3).await;
    let mut objects = populate(&c, 0, 0, 30).await;
    objects.extend(populate(&c, 1, 30, 10).await);
    assert_eq!(c.total_bytes(), 4000);

    let joiner = c.add_node().await;
    c.node(joiner).service().join().await.unwrap();

    assert_eq!(c.node(0).bytes(), 1000);
    assert_eq!(c.node(1).bytes(), 1000);
    assert_eq!(c.node(2).bytes(), 0);
    assert_eq!(c.node(joiner).bytes(), 2000);
    assert_eq!(c.total_bytes(), 4000);
    assert!(c.is_member(joiner).await);

    assert_single_copies(&c, &objects).await;
}

/// 4 nodes, node 3 leaves. Everything it held lands on the others.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_leave_drains_every_object() {
    let c = TestCluster::new(4).await;
    let mut objects = populate(&c, 0, 0, 5).await;
    objects.extend(populate(&c, 1, 5, 10).await);
    objects.extend(populate(&c, 3, 15, 12).await);

    let report = c.node(3).service().leave().await.unwrap();
    assert_eq!(report.objects, 12);
    assert_eq!(report.bytes, 1200);

    assert_eq!(c.node(3).bytes(), 0);
    assert!(c.node(3).object_names().await.is_empty());
    assert!(!c.is_member(3).await);
    assert_eq!(c.total_bytes(), 2700);

    // avg = ceil(2700 / 3) = 900: node 1 is above it and receives nothing.
    assert_eq!(c.node(1).bytes(), 1000);
    assert_single_copies(&c, &objects).await;
}

/// Metadata records that pointed at the sender now point at the receiver;
/// records for objects that stayed are untouched.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_join_repoints_metadata() {
    let mut c = TestCluster::new(1).await;
    let objects = populate(&c, 0, 0, 8).await;
    let origin = c.node(0).addr();
    for name in objects.keys() {
        let (hash, shard) = name.split_once('.').unwrap();
        let shard: usize = shard.parse().unwrap();
        let mut locations = vec!["10.9.9.9:8100".to_string(); 3];
        locations[shard] = origin.clone();
        c.metadata().add_version("meta-0", &format!("v-{hash}"), hash, locations);
    }

    let joiner = c.add_node().await;
    c.node(joiner).service().join().await.unwrap();
    assert_eq!(c.node(joiner).bytes(), 400);

    let moved = c.node(joiner).object_names().await;
    assert_eq!(moved.len(), 4);
    for name in objects.keys() {
        let (hash, shard) = name.split_once('.').unwrap();
        let shard: usize = shard.parse().unwrap();
        let locations = c.metadata().locations("meta-0", &format!("v-{hash}"));
        let expected = if moved.contains(name) {
            c.node(joiner).addr()
        } else {
            origin.clone()
        };
        assert_eq!(locations[shard], expected, "{name}");
        assert!(
            locations
                .iter()
                .enumerate()
                .all(|(i, l)| i == shard || l == "10.9.9.9:8100"),
            "other shard slots must not change"
        );
    }
}

/// One heavy peer is unreachable: the join reports the failure, but the
/// reachable peer still sends its surplus.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_join_with_unreachable_source() {
    let mut c = TestCluster::new(3).await;
    let mut objects = populate(&c, 0, 0, 20).await;
    objects.extend(populate(&c, 1, 20, 20).await);
    c.kill_node(1);

    let joiner = c.add_node().await;
    let err = c.node(joiner).service().join().await.unwrap_err();
    assert!(matches!(err, MigrateError::Net(_)), "got {err}");

    // avg = ceil(4000 / 4) = 1000: node 0 sent its 1000 byte surplus.
    assert_eq!(c.node(0).bytes(), 1000);
    assert_eq!(c.node(1).bytes(), 2000);
    assert_eq!(c.node(joiner).bytes(), 1000);
    assert_single_copies(&c, &objects).await;
}

/// A node joins, then leaves again: the cluster ends where it started in
/// total, with no copies lost or duplicated.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_join_then_leave() {
    let mut c = TestCluster::new(2).await;
    let mut objects = populate(&c, 0, 0, 12).await;
    objects.extend(populate(&c, 1, 12, 6).await);

    let joiner = c.add_node().await;
    c.node(joiner).service().join().await.unwrap();
    assert!(c.node(joiner).bytes() > 0);

    c.node(joiner).service().leave().await.unwrap();
    assert_eq!(c.node(joiner).bytes(), 0);
    assert!(!c.is_member(joiner).await);
    assert_eq!(c.total_bytes(), 1800);
    assert_single_copies(&c, &objects).await;
}

/// Two rebalances on one node do not overlap.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_concurrent_leave_is_refused() {
    let c = TestCluster::new(3).await;
    populate(&c, 0, 0, 30).await;

    let service = c.node(0).service().clone();
    let (first, second) = tokio::join!(service.leave(), service.leave());
    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let busy = [first, second]
        .into_iter()
        .filter_map(Result::err)
        .all(|e| matches!(e, MigrateError::Busy));
    assert!(busy);
}

/// A node that left and is then shut down must not publish its capacity
/// again; otherwise the next plan sees a capacity with no peer record.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_shutdown_after_leave_keeps_capacity_withdrawn() {
    let c = TestCluster::new(3).await;
    let objects = populate(&c, 0, 0, 5).await;
    let mut more = populate(&c, 1, 5, 5).await;

    c.node(2).service().leave().await.unwrap();
    c.node(2).service().shutdown().await.unwrap();
    // Longer than the reporter interval.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let key = keys::capacity_key(GROUP, &c.node(2).info().node_id);
    assert!(c.coordinator().get(&key).await.unwrap().is_none());

    // Another member can still plan and drain.
    let report = c.node(1).service().leave().await.unwrap();
    assert_eq!(report.objects, 5);
    assert_eq!(c.node(0).bytes(), 1000);
    assert_eq!(c.total_bytes(), 1000);

    more.extend(objects);
    assert_single_copies(&c, &more).await;
}

/// Shutting down a member publishes its final counter and keeps it in
/// the group.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_shutdown_of_member_saves_capacity() {
    let c = TestCluster::new(2).await;
    populate(&c, 0, 0, 3).await;

    c.node(0).service().shutdown().await.unwrap();

    let key = keys::capacity_key(GROUP, &c.node(0).info().node_id);
    assert_eq!(
        c.coordinator().get(&key).await.unwrap().as_deref(),
        Some("300")
    );
    assert!(c.is_member(0).await);
    // A second shutdown has nothing left to stop.
    c.node(0).service().shutdown().await.unwrap();
}
