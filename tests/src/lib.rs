//! Shared test harness for ballast integration tests.
//!
//! Provides [`TestCluster`]: N in-process nodes sharing one in-memory
//! coordination store, an in-process transfer transport with failure
//! injection, and a mock metadata service. Every node runs the real
//! migration service, capacity reporter and locate responder.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ballast_coord::{
    CapacityReporterConfig, CapacityTracker, Coordinator, MemoryCoordinator, PeerDirectory,
    ServiceDiscovery,
};
use ballast_locate::{LocateClient, LocatorConfig, LocatorHandle, start_locate};
use ballast_migrate::{
    MetadataError, MetadataService, MigrationSender, MigrationService, ReconcileBacklog, Receiver,
    Reconciler, SenderConfig,
};
use ballast_net::{
    Ack, FramedStream, MigrationMessage, MigrationTransport, NetError, RpcHandler, TransferStream,
    call, serve_stream,
};
use ballast_store::{CapacityCounter, ObjectStore};
use ballast_types::{LocateResponse, NodeId, ObjectName, PeerInfo, Version};
use bytes::Bytes;
use tempfile::TempDir;
use tokio::io::{duplex, split};

/// Group every test node belongs to.
pub const GROUP: &str = "it";

/// Discovery name of the mock metadata replicas.
pub const META_SERVICE: &str = "metaserver";

// =========================================================================
// In-process transport
// =========================================================================

/// Routes transfer streams into the target node's service over in-memory
/// pipes.
///
/// Supports failure injection: addresses in `down` are unreachable.
#[derive(Default)]
struct PipeTransport {
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    down: RwLock<HashSet<String>>,
}

impl PipeTransport {
    fn handler(&self, addr: &str) -> Result<Arc<dyn RpcHandler>, NetError> {
        if self.down.read().unwrap().contains(addr) {
            return Err(NetError::Connect(format!("{addr} is down")));
        }
        self.handlers
            .read()
            .unwrap()
            .get(addr)
            .cloned()
            .ok_or_else(|| NetError::Connect(format!("no node at {addr}")))
    }
}

#[async_trait]
impl MigrationTransport for PipeTransport {
    async fn open_stream(&self, addr: &str) -> Result<Box<dyn TransferStream>, NetError> {
        let handler = self.handler(addr)?;
        let (client, server) = duplex(1 << 20);
        let (server_recv, server_send) = split(server);
        tokio::spawn(async move {
            let _ = serve_stream(handler.as_ref(), server_send, server_recv).await;
        });
        let (client_recv, client_send) = split(client);
        Ok(Box::new(FramedStream::open(client_send, client_recv).await?))
    }

    async fn call(&self, addr: &str, request: MigrationMessage) -> Result<Ack, NetError> {
        let handler = self.handler(addr)?;
        let (client, server) = duplex(1 << 16);
        let (server_recv, server_send) = split(server);
        tokio::spawn(async move {
            let _ = serve_stream(handler.as_ref(), server_send, server_recv).await;
        });
        let (client_recv, client_send) = split(client);
        call(client_send, client_recv, &request).await
    }
}

// =========================================================================
// Mock metadata service
// =========================================================================

/// Metadata replicas held in memory, with per-replica update failures.
#[derive(Default)]
pub struct MockMetadata {
    versions: Mutex<HashMap<String, Vec<Version>>>,
    fail_updates: Mutex<HashSet<String>>,
}

impl MockMetadata {
    /// Record a version at `replica`.
    pub fn add_version(&self, replica: &str, name: &str, hash: &str, locations: Vec<String>) {
        self.versions
            .lock()
            .unwrap()
            .entry(replica.to_string())
            .or_default()
            .push(Version {
                name: name.to_string(),
                sequence: 1,
                hash: hash.to_string(),
                locations,
            });
    }

    /// Current locations of version `name` at `replica`.
    pub fn locations(&self, replica: &str, name: &str) -> Vec<String> {
        self.versions
            .lock()
            .unwrap()
            .get(replica)
            .and_then(|all| all.iter().find(|v| v.name == name))
            .map(|v| v.locations.clone())
            .unwrap_or_default()
    }

    /// Make every update at `replica` fail, or succeed again.
    pub fn set_failing(&self, replica: &str, failing: bool) {
        let mut fail = self.fail_updates.lock().unwrap();
        if failing {
            fail.insert(replica.to_string());
        } else {
            fail.remove(replica);
        }
    }
}

#[async_trait]
impl MetadataService for MockMetadata {
    async fn versions_by_hash(
        &self,
        replica: &str,
        hash: &str,
    ) -> Result<Vec<Version>, MetadataError> {
        Ok(self
            .versions
            .lock()
            .unwrap()
            .get(replica)
            .map(|all| all.iter().filter(|v| v.hash == hash).cloned().collect())
            .unwrap_or_default())
    }

    async fn update_locations(
        &self,
        replica: &str,
        name: &str,
        sequence: u64,
        locations: &[String],
    ) -> Result<(), MetadataError> {
        if self.fail_updates.lock().unwrap().contains(replica) {
            return Err(MetadataError::Unavailable {
                replica: replica.to_string(),
                reason: "injected".to_string(),
            });
        }
        let mut versions = self.versions.lock().unwrap();
        if let Some(v) = versions
            .get_mut(replica)
            .and_then(|all| all.iter_mut().find(|v| v.name == name && v.sequence == sequence))
        {
            v.locations = locations.to_vec();
        }
        Ok(())
    }
}

// =========================================================================
// TestNode
// =========================================================================

/// One in-process ballast node.
pub struct TestNode {
    _dir: TempDir,
    info: PeerInfo,
    store: Arc<ObjectStore>,
    tracker: Arc<CapacityTracker>,
    backlog: Arc<ReconcileBacklog>,
    service: Arc<MigrationService>,
    locator: LocatorHandle,
}

impl TestNode {
    /// Directory record of this node.
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Data-plane address, as stored in metadata and returned by locate.
    pub fn addr(&self) -> String {
        self.info.http_addr()
    }

    /// The node's migration service.
    pub fn service(&self) -> &Arc<MigrationService> {
        &self.service
    }

    /// Deferred reconciliations on this node.
    pub fn backlog(&self) -> &Arc<ReconcileBacklog> {
        &self.backlog
    }

    /// Bytes the node's capacity counter reports.
    pub fn bytes(&self) -> u64 {
        self.store.counter().bytes()
    }

    /// Store `data` under `name` and publish the new capacity.
    pub async fn write(&self, name: &str, data: &[u8]) {
        let name: ObjectName = name.parse().unwrap();
        self.store
            .put(&name, Bytes::copy_from_slice(data))
            .await
            .unwrap();
        self.tracker.save().await.unwrap();
    }

    /// Read `name` from the local store.
    pub async fn read(&self, name: &str) -> Option<Bytes> {
        self.store.get(&name.parse().unwrap()).await.unwrap()
    }

    /// Names of every local object.
    pub async fn object_names(&self) -> Vec<String> {
        self.store
            .walk()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name.to_string())
            .collect()
    }
}

// =========================================================================
// TestCluster
// =========================================================================

/// A simulated N-node cluster for integration tests.
pub struct TestCluster {
    coord: Arc<MemoryCoordinator>,
    transport: Arc<PipeTransport>,
    metadata: Arc<MockMetadata>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Create a cluster of `n` registered members and one metadata replica
    /// named `meta-0`.
    pub async fn new(n: usize) -> Self {
        let mut cluster = Self {
            coord: Arc::new(MemoryCoordinator::new()),
            transport: Arc::new(PipeTransport::default()),
            metadata: Arc::new(MockMetadata::default()),
            nodes: Vec::new(),
        };
        cluster.add_replica("meta-0").await;
        for _ in 0..n {
            let idx = cluster.add_node().await;
            cluster.register(idx).await;
        }
        cluster
    }

    fn coord(&self) -> Arc<dyn Coordinator> {
        self.coord.clone()
    }

    /// Announce a metadata replica in service discovery.
    pub async fn add_replica(&self, replica: &str) {
        ServiceDiscovery::new(self.coord())
            .announce(META_SERVICE, replica, replica)
            .await
            .unwrap();
    }

    /// Start a new node that is reachable but not yet a member.
    ///
    /// Returns its index.
    pub async fn add_node(&mut self) -> usize {
        let idx = self.nodes.len();
        let seed = idx + 1;
        let dir = TempDir::new().unwrap();
        let coord = self.coord();

        let counter = Arc::new(CapacityCounter::new());
        let store = Arc::new(
            ObjectStore::open(
                dir.path().join("objects"),
                dir.path().join("tmp"),
                counter.clone(),
                1024,
            )
            .unwrap(),
        );
        let info = PeerInfo {
            node_id: NodeId::new(format!("node-{idx}")),
            location: format!("10.0.0.{seed}"),
            http_port: 8100,
            rpc_port: 4100,
            endpoint_id: format!("endpoint{seed}"),
        };

        let tracker = Arc::new(CapacityTracker::new(
            coord.clone(),
            GROUP,
            info.node_id.clone(),
            counter,
        ));
        let reporter = tracker.spawn_reporter(CapacityReporterConfig::test_config());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            self.metadata.clone(),
            ServiceDiscovery::new(coord.clone()),
            META_SERVICE,
            info.http_addr(),
        ));
        let backlog = Arc::new(ReconcileBacklog::new());
        let service = Arc::new(MigrationService::new(
            info.clone(),
            PeerDirectory::new(coord.clone(), GROUP),
            tracker.clone(),
            Some(reporter),
            self.transport.clone(),
            MigrationSender::new(
                store.clone(),
                self.transport.clone(),
                info.http_addr(),
                SenderConfig::test_config(),
            ),
            Receiver::new(store.clone(), reconciler, backlog.clone()),
        ));
        self.transport
            .handlers
            .write()
            .unwrap()
            .insert(info.transfer_addr(), service.clone());

        let locator = start_locate(
            coord,
            store.clone(),
            GROUP,
            info.http_addr(),
            LocatorConfig::test_config(),
        )
        .await
        .unwrap();

        self.nodes.push(TestNode {
            _dir: dir,
            info,
            store,
            tracker,
            backlog,
            service,
            locator,
        });
        idx
    }

    /// Put node `i` in the peer directory without pulling any data.
    pub async fn register(&self, i: usize) {
        let node = &self.nodes[i];
        PeerDirectory::new(self.coord(), GROUP)
            .register(&node.info)
            .await
            .unwrap();
        node.tracker.save().await.unwrap();
    }

    /// Access node `i`.
    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }

    /// Number of nodes, members or not.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The shared mock metadata service.
    pub fn metadata(&self) -> &MockMetadata {
        &self.metadata
    }

    /// The shared in-memory coordination store.
    pub fn coordinator(&self) -> &Arc<MemoryCoordinator> {
        &self.coord
    }

    /// Make node `i` unreachable for transfers.
    pub fn kill_node(&self, i: usize) {
        let addr = self.nodes[i].info.transfer_addr();
        self.transport.down.write().unwrap().insert(addr);
    }

    /// Make node `i` reachable again.
    pub fn revive_node(&self, i: usize) {
        let addr = self.nodes[i].info.transfer_addr();
        self.transport.down.write().unwrap().remove(&addr);
    }

    /// Stop node `i`'s locate responder.
    pub async fn stop_locator(&self, i: usize) {
        self.nodes[i].locator.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Which nodes hold each object, by name.
    pub async fn holders(&self) -> BTreeMap<String, Vec<usize>> {
        let mut holders: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for name in node.object_names().await {
                holders.entry(name).or_default().push(i);
            }
        }
        holders
    }

    /// Sum of every node's capacity counter.
    pub fn total_bytes(&self) -> u64 {
        self.nodes.iter().map(TestNode::bytes).sum()
    }

    /// Ask the cluster who holds `name`.
    pub async fn locate_all(&self, name: &str) -> Vec<LocateResponse> {
        LocateClient::new(self.coord(), GROUP)
            .locate_all(&name.parse().unwrap(), Duration::from_millis(200))
            .await
            .unwrap()
    }

    /// Whether node `i` is in the peer directory.
    pub async fn is_member(&self, i: usize) -> bool {
        PeerDirectory::new(self.coord(), GROUP)
            .resolve(&self.nodes[i].info.node_id)
            .await
            .unwrap()
            .is_some()
    }
}

// =========================================================================
// Data helpers
// =========================================================================

/// Generate test data with a specific seed (for unique objects).
pub fn test_data_seeded(size: usize, seed: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut state: u32 = seed;
    for _ in 0..size {
        state = state.wrapping_mul(1103515245).wrapping_add(12345);
        data.push((state >> 16) as u8);
    }
    data
}

/// A blob name for object `i`, shard `shard`.
pub fn object_name(i: usize, shard: usize) -> String {
    format!("{i:08x}.{shard}")
}
