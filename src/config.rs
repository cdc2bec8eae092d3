//! Cluster, node and logging configuration.
//!
//! Everything has a default, so a missing or partial YAML file still yields a
//! runnable three node cluster on `127.0.0.1:8000..8002`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::membership::{NodeAddress, NodeIdentity};
use crate::types::NodeId;

/// Number of times an RPC is attempted when the peer gives no response.
pub const MAX_SEND_ATTEMPTS: usize = 2;

pub const DEFAULT_NODE_COUNT: usize = 3;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_BASE_PORT: u16 = 8000;
pub const DEFAULT_WORKER_COUNT: usize = 10;
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("node id {id} is outside the cluster of {nodes} nodes")]
    InvalidNodeId { id: NodeId, nodes: usize },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Fixed membership: ids `0..nodes`, node `i` listening on `base_port + i`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_base_port")]
    pub base_port: u16,
}

impl ClusterConfig {
    pub fn address_of(&self, id: NodeId) -> NodeAddress {
        NodeAddress::new(self.host.clone(), self.base_port + id as u16)
    }

    /// The identities of every node in the cluster, in id order.
    pub fn identities(&self) -> Vec<NodeIdentity> {
        (0..self.nodes as NodeId)
            .map(|id| NodeIdentity::new(id, self.address_of(id)))
            .collect()
    }

    pub fn check_id(&self, id: NodeId) -> Result<(), ConfigError> {
        if (id as usize) < self.nodes {
            Ok(())
        } else {
            Err(ConfigError::InvalidNodeId { id, nodes: self.nodes })
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            host: default_host(),
            base_port: default_base_port(),
        }
    }
}

/// Per node resources.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Size of the worker pool handling inbound requests.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Upper bound on a single outbound RPC attempt.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl NodeConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// When set, logs go to `<log_dir>/node_<id>.log` instead of stdout.
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

fn default_nodes() -> usize {
    DEFAULT_NODE_COUNT
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_rpc_timeout_ms() -> u64 {
    DEFAULT_RPC_TIMEOUT.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load the configuration from a YAML file. A missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::debug!("config file {} not found, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}
