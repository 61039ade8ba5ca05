//! AtomWeave Configuration
//!
//! This module provides configuration structures for an AtomWeave node:
//! identity, peers, the three periodic managers and the RPC retry policy.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main AtomWeave configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomWeaveConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Replica placement configuration
    #[serde(default)]
    pub replication: ReplicaConfig,

    /// Update log synchronization configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Consistency audit configuration
    #[serde(default)]
    pub consistency: ConsistencyConfig,

    /// Peer RPC timeout and retry policy
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Snapshot persistence configuration
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address to bind for cluster communication
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// A statically configured peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node identifier
    pub id: String,
    /// Peer cluster address (host:port)
    pub address: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Known peers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// How long a failed peer is kept out of the available set, in milliseconds
    #[serde(default = "default_peer_retry_ms")]
    pub peer_retry_ms: u64,
}

/// Replica placement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Target number of remote replicas per atom
    #[serde(default = "default_replication_factor")]
    pub factor: usize,

    /// Replica validation interval in milliseconds
    #[serde(default = "default_validate_interval_ms")]
    pub validate_interval_ms: u64,
}

/// Update log synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Pull sync interval in milliseconds
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
}

/// Consistency audit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Audit interval in milliseconds; also the freshness window of the
    /// write guard
    #[serde(default = "default_audit_interval_ms")]
    pub interval_ms: u64,
}

/// Peer RPC timeout and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Per-attempt request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Attempts per request, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Snapshot persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistenceConfig {
    /// Atom snapshot loaded at start and written at stop
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:7700".to_string()
}

fn default_peer_retry_ms() -> u64 {
    5000
}

fn default_replication_factor() -> usize {
    3
}

fn default_validate_interval_ms() -> u64 {
    30_000
}

fn default_sync_interval_ms() -> u64 {
    5_000
}

fn default_audit_interval_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            peer_retry_ms: default_peer_retry_ms(),
        }
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            factor: default_replication_factor(),
            validate_interval_ms: default_validate_interval_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sync_interval_ms(),
        }
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_audit_interval_ms(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AtomWeaveConfig {
    /// Build a configuration with defaults for the given node id
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.into(),
                bind_address: default_bind_address(),
                advertise_address: None,
            },
            cluster: ClusterConfig::default(),
            replication: ReplicaConfig::default(),
            sync: SyncConfig::default(),
            consistency: ConsistencyConfig::default(),
            rpc: RpcConfig::default(),
            logging: LoggingConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: AtomWeaveConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.replication.factor == 0 {
            return Err(crate::Error::Config("replication.factor must be at least 1".into()));
        }

        if self.sync.interval_ms == 0
            || self.consistency.interval_ms == 0
            || self.replication.validate_interval_ms == 0
        {
            return Err(crate::Error::Config("timer intervals must be non-zero".into()));
        }

        if self.rpc.max_attempts == 0 {
            return Err(crate::Error::Config("rpc.max_attempts must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.cluster.peers {
            if peer.id == self.node.id {
                return Err(crate::Error::Config(format!(
                    "cluster.peers contains this node's own id '{}'",
                    peer.id
                )));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate peer id '{}'",
                    peer.id
                )));
            }
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get pull sync interval as Duration
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync.interval_ms)
    }

    /// Get consistency audit interval as Duration
    pub fn audit_interval(&self) -> Duration {
        Duration::from_millis(self.consistency.interval_ms)
    }

    /// Get replica validation interval as Duration
    pub fn validate_interval(&self) -> Duration {
        Duration::from_millis(self.replication.validate_interval_ms)
    }

    /// Get peer retry cooldown as Duration
    pub fn peer_retry(&self) -> Duration {
        Duration::from_millis(self.cluster.peer_retry_ms)
    }
}

impl RpcConfig {
    /// Per-attempt request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// TCP connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff to wait after the given failed attempt (1-based), doubling
    /// each time and capped at `max_backoff_ms`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }
}
