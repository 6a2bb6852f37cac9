//! `ballastd`: the ballast storage node daemon.
//!
//! # Usage
//!
//! ```text
//! ballastd start                          # start the node
//! ballastd start -c ballast.toml         # start with a config file
//! ballastd start --join                   # start and pull a share of data
//! ballastd leave                          # drain the local node and leave
//! ballastd status                         # show peers and capacities
//! ```

mod config;
mod handler;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ballast_coord::{
    CapacityTracker, Coordinator, EtcdCoordinator, PeerDirectory, ServiceDiscovery,
};
use ballast_locate::start_locate;
use ballast_migrate::{
    HttpMetadataService, MigrationSender, MigrationService, ReconcileBacklog, Receiver,
    Reconciler,
};
use ballast_net::{IrohTransport, MigrationMessage, MigrationTransport};
use ballast_store::{CapacityCounter, ObjectStore};
use ballast_types::{NodeId, PeerInfo};
use clap::{Parser, Subcommand};
use iroh::protocol::Router;
use iroh::{Endpoint, SecretKey};
use tracing::{error, info, warn};

use config::CliConfig;
use handler::TransferProtocol;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "ballastd", version, about = "ballast storage node daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node.
    Start {
        /// Override data directory (useful for running multiple instances).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Override the node id.
        #[arg(long)]
        id: Option<String>,

        /// Override the transfer endpoint port.
        #[arg(long)]
        rpc_port: Option<u16>,

        /// Cluster secret (nodes must share the same secret).
        #[arg(long, env = "BALLAST_SECRET")]
        secret: Option<String>,

        /// etcd endpoint(s). Can be specified multiple times.
        #[arg(long, env = "BALLAST_ETCD")]
        etcd: Vec<String>,

        /// Pull a share of the cluster's data once the node is serving.
        #[arg(long)]
        join: bool,
    },

    /// Ask a running node to drain its objects to its peers and leave.
    Leave {
        /// Node to drain. Defaults to the configured node id.
        #[arg(long)]
        node: Option<String>,
    },

    /// Show peers and capacities from the coordination store.
    Status,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start {
            data_dir,
            id,
            rpc_port,
            secret,
            etcd,
            join,
        } => {
            // CLI args override config file values.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(id) = id {
                config.node.id = id;
            }
            if let Some(port) = rpc_port {
                config.node.rpc_port = port;
            }
            if let Some(s) = secret {
                config.cluster.secret = s;
            }
            if !etcd.is_empty() {
                config.etcd.endpoints = etcd;
            }
            cmd_start(config, join).await
        }
        Commands::Leave { node } => cmd_leave(&config, node).await,
        Commands::Status => cmd_status(&config).await,
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// ballastd start
// -----------------------------------------------------------------------

async fn cmd_start(mut config: CliConfig, join: bool) -> Result<()> {
    info!("starting ballastd");
    std::fs::create_dir_all(&config.node.data_dir).context("failed to create data directory")?;

    if config.node.id.is_empty() {
        config.node.id = load_or_create_node_id(&config.node.data_dir)?;
    }
    let node_id = NodeId::new(config.node.id.clone());
    info!(
        %node_id,
        data_dir = %config.node.data_dir.display(),
        storage_dir = %config.storage_dir().display(),
        group = %config.cluster.group,
        "node configuration"
    );

    // --- Coordination store ---
    let coord: Arc<dyn Coordinator> = Arc::new(
        EtcdCoordinator::connect(&config.etcd.endpoints)
            .await
            .context("failed to connect to etcd")?,
    );

    // --- Object store ---
    let counter = Arc::new(CapacityCounter::new());
    let store = Arc::new(
        ObjectStore::open(
            config.storage_dir(),
            config.temp_dir(),
            counter.clone(),
            config.cache_entries(),
        )
        .context("failed to open object store")?,
    );
    let warm = store.warm_up().await.context("store warm-up failed")?;
    info!(
        objects = warm.objects,
        bytes = warm.bytes,
        stale_temps = warm.stale_temps,
        "object store ready"
    );

    // --- Transfer endpoint (iroh QUIC) ---
    let secret_key = load_or_create_secret_key(&config.node.data_dir)?;
    let cluster_alpn = ballast_net::cluster_alpn(config.cluster.secret.as_bytes());
    info!(
        cluster_id = %blake3::hash(config.cluster.secret.as_bytes()).to_hex()[..16],
        "cluster identity derived from secret"
    );
    let endpoint = Endpoint::builder()
        .secret_key(secret_key)
        .alpns(vec![cluster_alpn.clone()])
        .relay_mode(iroh::RelayMode::Disabled)
        .bind_addr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.node.rpc_port))
        .bind()
        .await
        .context("failed to bind iroh endpoint")?;
    let transport = Arc::new(IrohTransport::from_endpoint_with_alpn(
        endpoint.clone(),
        cluster_alpn.clone(),
    ));

    let self_info = PeerInfo {
        node_id: node_id.clone(),
        location: config.node.location.clone(),
        http_port: config.node.http_port,
        rpc_port: config.node.rpc_port,
        endpoint_id: endpoint.id().to_string(),
    };
    let self_addr = self_info.http_addr();
    info!(transfer_addr = %self_info.transfer_addr(), %self_addr, "iroh endpoint ready");

    // --- Capacity and membership ---
    let tracker = Arc::new(CapacityTracker::new(
        coord.clone(),
        config.cluster.group.clone(),
        node_id.clone(),
        counter,
    ));
    let reporter = tracker.spawn_reporter(config.reporter_config());
    let peers = PeerDirectory::new(coord.clone(), config.cluster.group.clone());
    peers
        .register(&self_info)
        .await
        .context("failed to register in peer directory")?;

    // --- Migration ---
    let metadata = Arc::new(
        HttpMetadataService::new(config.metadata_timeout())
            .context("failed to build metadata client")?,
    );
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        metadata,
        ServiceDiscovery::new(coord.clone()),
        config.cluster.meta_service.clone(),
        self_addr.clone(),
    ));
    let backlog = Arc::new(ReconcileBacklog::new());
    let backlog_task = backlog.spawn_retry(reconciler.clone(), config.reconcile_retry_interval());
    let receiver = Receiver::new(store.clone(), reconciler, backlog);
    let sender = MigrationSender::new(
        store.clone(),
        transport.clone(),
        self_addr.clone(),
        config.sender_config(),
    );
    let service = Arc::new(MigrationService::new(
        self_info,
        peers,
        tracker,
        Some(reporter),
        transport.clone(),
        sender,
        receiver,
    ));

    // --- Locate responder ---
    let locator = start_locate(
        coord.clone(),
        store.clone(),
        &config.cluster.group,
        self_addr,
        config.locator_config(),
    )
    .await
    .context("failed to start locate responder")?;

    // --- Incoming transfer RPC ---
    let router = Router::builder(endpoint.clone())
        .accept(cluster_alpn, TransferProtocol::new(service.clone()))
        .spawn();

    if join {
        let service = service.clone();
        tokio::spawn(async move {
            match service.join().await {
                Ok(()) => info!("joined cluster"),
                Err(e) => error!(error = %e, "join failed, see logs for detail"),
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    locator.stop().await;
    backlog_task.stop().await;
    if let Err(e) = service.shutdown().await {
        warn!(error = %e, "failed to save final capacity");
    }
    router.shutdown().await.context("router shutdown failed")?;
    transport.close().await;

    Ok(())
}

// -----------------------------------------------------------------------
// ballastd leave
// -----------------------------------------------------------------------

async fn cmd_leave(config: &CliConfig, node: Option<String>) -> Result<()> {
    let node = match node {
        Some(id) => id,
        None if !config.node.id.is_empty() => config.node.id.clone(),
        None => load_or_create_node_id(&config.node.data_dir)?,
    };
    let coord: Arc<dyn Coordinator> = Arc::new(
        EtcdCoordinator::connect(&config.etcd.endpoints)
            .await
            .context("failed to connect to etcd")?,
    );
    let peers = PeerDirectory::new(coord, config.cluster.group.clone());
    let info = peers
        .resolve(&NodeId::new(node.clone()))
        .await?
        .with_context(|| format!("node {node} is not in the peer directory"))?;

    // An ephemeral client identity; the cluster only checks the ALPN.
    let secret_key = {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        SecretKey::from(bytes)
    };
    let alpn = ballast_net::cluster_alpn(config.cluster.secret.as_bytes());
    let endpoint = Endpoint::builder()
        .secret_key(secret_key)
        .relay_mode(iroh::RelayMode::Disabled)
        .bind()
        .await
        .context("failed to bind iroh endpoint")?;
    let transport = IrohTransport::from_endpoint_with_alpn(endpoint, alpn);

    println!("Draining {node} ({})...", info.transfer_addr());
    let ack = transport
        .call(&info.transfer_addr(), MigrationMessage::LeaveCommand)
        .await
        .context("leave request failed")?;
    transport.close().await;

    anyhow::ensure!(ack.success, "node refused to leave: {}", ack.message);
    println!("{node} left the cluster");
    Ok(())
}

// -----------------------------------------------------------------------
// ballastd status
// -----------------------------------------------------------------------

async fn cmd_status(config: &CliConfig) -> Result<()> {
    let coord: Arc<dyn Coordinator> = Arc::new(
        EtcdCoordinator::connect(&config.etcd.endpoints)
            .await
            .context("failed to connect to etcd")?,
    );
    let peers = PeerDirectory::new(coord.clone(), config.cluster.group.clone())
        .peer_map()
        .await?;
    let prefix = ballast_coord::keys::capacity_prefix(&config.cluster.group);
    let capacities = coord.get_prefix(&prefix).await?;

    println!("Group: {}", config.cluster.group);
    println!("Peers: {}", peers.len());
    let mut ids: Vec<_> = peers.keys().collect();
    ids.sort();
    for id in ids {
        let info = &peers[id];
        let bytes = capacities
            .iter()
            .find(|(key, _)| key.strip_prefix(&prefix) == Some(id.as_str()))
            .map(|(_, value)| value.as_str())
            .unwrap_or("-");
        println!(
            "  {id} http={} transfer={} bytes={bytes}",
            info.http_addr(),
            info.transfer_addr()
        );
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Identity
// -----------------------------------------------------------------------

/// Load or create a persistent iroh secret key from `data_dir/node.key`.
fn load_or_create_secret_key(data_dir: &Path) -> Result<SecretKey> {
    let key_path = data_dir.join("node.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("failed to read node.key")?;
        anyhow::ensure!(bytes.len() == 32, "node.key must be exactly 32 bytes");
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        let key = SecretKey::from_bytes(&arr);
        info!(endpoint_id = %key.public().fmt_short(), "loaded existing node key");
        Ok(key)
    } else {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let key = SecretKey::from(bytes);
        std::fs::write(&key_path, key.to_bytes()).context("failed to write node.key")?;
        info!(
            path = %key_path.display(),
            endpoint_id = %key.public().fmt_short(),
            "generated new node key"
        );
        Ok(key)
    }
}

/// Load or create the node id in `data_dir/node.id`.
///
/// New ids are the host name plus a random suffix.
fn load_or_create_node_id(data_dir: &Path) -> Result<String> {
    let id_path = data_dir.join("node.id");
    if id_path.exists() {
        let id = std::fs::read_to_string(&id_path).context("failed to read node.id")?;
        let id = id.trim().to_string();
        anyhow::ensure!(!id.is_empty(), "node.id is empty");
        return Ok(id);
    }

    use rand::RngCore;
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "node".to_string());
    let mut suffix = [0u8; 4];
    rand::rng().fill_bytes(&mut suffix);
    let suffix: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
    let id = format!("{host}-{suffix}");

    std::fs::create_dir_all(data_dir).context("failed to create data directory")?;
    std::fs::write(&id_path, &id).context("failed to write node.id")?;
    info!(path = %id_path.display(), %id, "generated new node id");
    Ok(id)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
