//! Node configuration
//!
//! Values come from a YAML file, then `RAFTKV_*` environment variables, then
//! command-line flags, each layer overriding the previous one.

use raft_kv_core::{NodeId, PeerInfo, RaftKvError, Result};
use raft_kv_raft::RaftConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub cluster: ClusterSection,
    pub raft: RaftSection,
    pub service: ServiceSection,
    pub storage: StorageSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub id: NodeId,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self { id: 1 }
    }
}

/// Every member of the cluster, this node included
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub peers: Vec<PeerInfo>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            peers: vec![PeerInfo::new(1, "127.0.0.1:7001", "127.0.0.1:8001")],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSection {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub rpc_retry_interval_ms: u64,
    pub max_entries_per_append: usize,
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
            rpc_retry_interval_ms: 50,
            max_entries_per_append: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// How long a write waits to be applied before it is reported failed
    pub write_timeout_ms: u64,
    /// Interval at which a pending write re-checks the applied state
    pub apply_poll_interval_ms: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            write_timeout_ms: 5000,
            apply_poll_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RaftKvError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| RaftKvError::Configuration(format!("invalid config: {}", e)))
    }

    /// Save config to file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| RaftKvError::Configuration(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay `RAFTKV_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overlay variables resolved through `lookup`
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(id) = lookup("RAFTKV_NODE_ID") {
            self.node.id = parse_var("RAFTKV_NODE_ID", &id)?;
        }
        if let Some(peers) = lookup("RAFTKV_PEERS") {
            self.cluster.peers = parse_peers(&peers)?;
        }
        if let Some(dir) = lookup("RAFTKV_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("RAFTKV_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(ms) = lookup("RAFTKV_ELECTION_TIMEOUT_MIN_MS") {
            self.raft.election_timeout_min_ms = parse_var("RAFTKV_ELECTION_TIMEOUT_MIN_MS", &ms)?;
        }
        if let Some(ms) = lookup("RAFTKV_ELECTION_TIMEOUT_MAX_MS") {
            self.raft.election_timeout_max_ms = parse_var("RAFTKV_ELECTION_TIMEOUT_MAX_MS", &ms)?;
        }
        if let Some(ms) = lookup("RAFTKV_HEARTBEAT_INTERVAL_MS") {
            self.raft.heartbeat_interval_ms = parse_var("RAFTKV_HEARTBEAT_INTERVAL_MS", &ms)?;
        }
        if let Some(ms) = lookup("RAFTKV_WRITE_TIMEOUT_MS") {
            self.service.write_timeout_ms = parse_var("RAFTKV_WRITE_TIMEOUT_MS", &ms)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for peer in &self.cluster.peers {
            if !ids.insert(peer.id) {
                return Err(RaftKvError::Configuration(format!(
                    "node id {} listed twice",
                    peer.id
                )));
            }
        }
        if !ids.contains(&self.node.id) {
            return Err(RaftKvError::Configuration(format!(
                "node id {} is not in the peer list",
                self.node.id
            )));
        }
        if self.service.write_timeout_ms == 0 || self.service.apply_poll_interval_ms == 0 {
            return Err(RaftKvError::Configuration(
                "write timeout and poll interval must be positive".to_string(),
            ));
        }
        self.to_raft_config().validate()
    }

    /// Addresses of this node
    pub fn self_info(&self) -> Result<&PeerInfo> {
        self.cluster
            .peers
            .iter()
            .find(|p| p.id == self.node.id)
            .ok_or(RaftKvError::UnknownPeer(self.node.id))
    }

    pub fn to_raft_config(&self) -> RaftConfig {
        RaftConfig {
            node_id: self.node.id,
            peers: self
                .cluster
                .peers
                .iter()
                .map(|p| p.id)
                .filter(|&id| id != self.node.id)
                .collect(),
            election_timeout_min: Duration::from_millis(self.raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.raft.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(self.raft.heartbeat_interval_ms),
            rpc_retry_interval: Duration::from_millis(self.raft.rpc_retry_interval_ms),
            max_entries_per_append: self.raft.max_entries_per_append,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.raft.rpc_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.service.write_timeout_ms)
    }

    pub fn apply_poll_interval(&self) -> Duration {
        Duration::from_millis(self.service.apply_poll_interval_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RaftKvError::Configuration(format!("{}: cannot parse {:?}", name, value)))
}

/// Parse a peer written as `id@raft_addr@kv_addr`
pub fn parse_peer(raw: &str) -> Result<PeerInfo> {
    let parts: Vec<&str> = raw.trim().split('@').collect();
    match parts.as_slice() {
        [id, raft_addr, kv_addr] if !raft_addr.is_empty() && !kv_addr.is_empty() => Ok(
            PeerInfo::new(parse_var("peer id", id)?, *raft_addr, *kv_addr),
        ),
        _ => Err(RaftKvError::Configuration(format!(
            "peer {:?} is not id@raft_addr@kv_addr",
            raw
        ))),
    }
}

/// Parse a comma-separated list of peers
pub fn parse_peers(list: &str) -> Result<Vec<PeerInfo>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_peer)
        .collect()
}
