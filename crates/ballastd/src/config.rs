//! TOML configuration for the ballast daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ballast_coord::CapacityReporterConfig;
use ballast_locate::LocatorConfig;
use ballast_migrate::SenderConfig;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity, directories and advertised addresses.
    pub node: NodeSection,
    /// Cluster membership.
    pub cluster: ClusterSection,
    /// Coordination store.
    pub etcd: EtcdSection,
    /// Transfer tuning.
    pub migration: MigrationSection,
    /// Capacity reporting.
    pub capacity: CapacitySection,
    /// Locate protocol.
    pub locate: LocateSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node id. Generated and persisted in `data_dir` when empty.
    pub id: String,
    /// Directory for the node key and id.
    pub data_dir: PathBuf,
    /// Blob directory. Defaults to `<data_dir>/objects`.
    pub storage_dir: Option<PathBuf>,
    /// Staging directory for writes; must share a filesystem with
    /// `storage_dir`. Defaults to `<data_dir>/tmp`.
    pub temp_dir: Option<PathBuf>,
    /// Advertised host name or IP.
    pub location: String,
    /// Data-plane port advertised as this node's object location.
    pub http_port: u16,
    /// UDP port of the transfer endpoint.
    pub rpc_port: u16,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".ballast"))
            .unwrap_or_else(|| PathBuf::from(".ballast"));
        Self {
            id: String::new(),
            data_dir,
            storage_dir: None,
            temp_dir: None,
            location: "127.0.0.1".to_string(),
            http_port: 8100,
            rpc_port: 4100,
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Group name scoping every coordination key.
    pub group: String,
    /// Shared secret; nodes with different secrets cannot connect.
    pub secret: String,
    /// Discovery name of the metadata-service replicas.
    pub meta_service: String,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            secret: String::new(),
            meta_service: "metaserver".to_string(),
        }
    }
}

/// `[etcd]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EtcdSection {
    /// Client endpoints.
    pub endpoints: Vec<String>,
}

impl Default for EtcdSection {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
        }
    }
}

/// `[migration]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    /// Files open for reading at once while sending.
    pub read_concurrency: Option<usize>,
    /// Maximum bytes per chunk frame.
    pub chunk_size: Option<usize>,
    /// Object handles queued per target stream.
    pub queue_depth: Option<usize>,
    /// Seconds between retries of deferred reconciliations.
    pub reconcile_retry_secs: Option<u64>,
    /// Per-request timeout for metadata-service calls, in seconds.
    pub metadata_timeout_secs: Option<u64>,
}

/// `[capacity]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CapacitySection {
    /// Seconds between capacity saves.
    pub sync_interval_secs: Option<u64>,
}

/// `[locate]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LocateSection {
    /// Names held in the existence cache.
    pub cache_entries: Option<usize>,
    /// Initial re-subscribe backoff, in milliseconds.
    pub resubscribe_backoff_ms: Option<u64>,
    /// Backoff ceiling, in milliseconds.
    pub max_backoff_ms: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Effective blob directory.
    pub fn storage_dir(&self) -> PathBuf {
        self.node
            .storage_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("objects"))
    }

    /// Effective staging directory.
    pub fn temp_dir(&self) -> PathBuf {
        self.node
            .temp_dir
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("tmp"))
    }

    /// Sender tuning, falling back to library defaults.
    pub fn sender_config(&self) -> SenderConfig {
        let defaults = SenderConfig::default();
        SenderConfig {
            read_concurrency: self
                .migration
                .read_concurrency
                .unwrap_or(defaults.read_concurrency),
            chunk_size: self.migration.chunk_size.unwrap_or(defaults.chunk_size),
            queue_depth: self.migration.queue_depth.unwrap_or(defaults.queue_depth),
        }
    }

    /// Interval between backlog retries. Defaults to 30 s.
    pub fn reconcile_retry_interval(&self) -> Duration {
        Duration::from_secs(self.migration.reconcile_retry_secs.unwrap_or(30))
    }

    /// Metadata-service request timeout. Defaults to 10 s.
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.migration.metadata_timeout_secs.unwrap_or(10))
    }

    /// Capacity reporter tuning.
    pub fn reporter_config(&self) -> CapacityReporterConfig {
        match self.capacity.sync_interval_secs {
            Some(secs) => CapacityReporterConfig {
                sync_interval: Duration::from_secs(secs),
            },
            None => CapacityReporterConfig::default(),
        }
    }

    /// Existence-cache capacity. Defaults to 100 000 names.
    pub fn cache_entries(&self) -> usize {
        self.locate.cache_entries.unwrap_or(100_000)
    }

    /// Locate responder tuning.
    pub fn locator_config(&self) -> LocatorConfig {
        let defaults = LocatorConfig::default();
        LocatorConfig {
            resubscribe_backoff: self
                .locate
                .resubscribe_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.resubscribe_backoff),
            max_backoff: self
                .locate
                .max_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
        }
    }
}
