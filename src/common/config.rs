//! Configuration for minicoord nodes
//!
//! Sources are merged in this order (later overrides earlier):
//! 1. Type defaults
//! 2. TOML file from `MINICOORD_CONFIG` (default `minicoord.toml`, optional)
//! 3. Environment variables prefixed with `MINICOORD__`

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::common::{Error, Result};

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Node-level config
    #[serde(default)]
    pub node: NodeConfig,

    /// Coordinator tuning
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which backend holds the replicated state documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Rocksdb,
    Sled,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Bind address for HTTP API
    pub bind_addr: SocketAddr,

    /// Directory of the document store
    pub db_path: PathBuf,

    /// Document store backend
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Replica set name of this node
    pub set_name: String,

    /// Hosts of this node's replica set
    pub hosts: Vec<String>,

    /// Step up immediately on start
    #[serde(default)]
    pub start_as_primary: bool,
}

fn default_backend() -> BackendKind {
    BackendKind::Rocksdb
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7000)),
            db_path: PathBuf::from("./minicoord-data"),
            backend: default_backend(),
            set_name: "recipient".to_string(),
            hosts: vec!["localhost:7000".to_string()],
            start_as_primary: false,
        }
    }
}

impl NodeConfig {
    /// Connection string of this node's own replica set (`setName/h1,h2`).
    pub fn connection_string(&self) -> String {
        format!("{}/{}", self.set_name, self.hosts.join(","))
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Retention window between forget and physical deletion
    #[serde(default = "default_gc_delay")]
    pub garbage_collection_delay_ms: u64,

    /// Period of the garbage collector sweep
    #[serde(default = "default_gc_interval")]
    pub gc_interval_ms: u64,

    /// Local retries of a transient workload error before the handle is abandoned
    #[serde(default = "default_max_retries")]
    pub max_transient_retries: usize,

    #[serde(default = "default_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub retry_max_backoff_ms: u64,

    /// Tick of the simulated oplog applier in the migration workload
    #[serde(default = "default_oplog_interval")]
    pub oplog_apply_interval_ms: u64,
}

/// Upper bound of the retention window (one year)
pub const MAX_GARBAGE_COLLECTION_DELAY_MS: u64 = 365 * 24 * 60 * 60 * 1000;

fn default_gc_delay() -> u64 {
    15 * 60 * 1000
}
fn default_gc_interval() -> u64 {
    1_000
}
fn default_max_retries() -> usize {
    5
}
fn default_initial_backoff() -> u64 {
    50
}
fn default_max_backoff() -> u64 {
    2_000
}
fn default_oplog_interval() -> u64 {
    20
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            garbage_collection_delay_ms: default_gc_delay(),
            gc_interval_ms: default_gc_interval(),
            max_transient_retries: default_max_retries(),
            retry_initial_backoff_ms: default_initial_backoff(),
            retry_max_backoff_ms: default_max_backoff(),
            oplog_apply_interval_ms: default_oplog_interval(),
        }
    }
}

impl CoordinatorConfig {
    pub fn garbage_collection_delay(&self) -> Duration {
        Duration::from_millis(self.garbage_collection_delay_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    pub fn oplog_apply_interval(&self) -> Duration {
        Duration::from_millis(self.oplog_apply_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.garbage_collection_delay_ms > MAX_GARBAGE_COLLECTION_DELAY_MS {
            return Err(Error::InvalidConfig(format!(
                "garbage_collection_delay_ms must be <= {} (got {})",
                MAX_GARBAGE_COLLECTION_DELAY_MS, self.garbage_collection_delay_ms
            )));
        }
        if self.gc_interval_ms == 0 {
            return Err(Error::InvalidConfig("gc_interval_ms must be > 0".into()));
        }
        if self.max_transient_retries == 0 {
            return Err(Error::InvalidConfig(
                "max_transient_retries must be > 0".into(),
            ));
        }
        if self.retry_initial_backoff_ms == 0
            || self.retry_initial_backoff_ms > self.retry_max_backoff_ms
        {
            return Err(Error::InvalidConfig(format!(
                "retry backoff must satisfy 0 < initial ({}) <= max ({})",
                self.retry_initial_backoff_ms, self.retry_max_backoff_ms
            )));
        }
        if self.oplog_apply_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "oplog_apply_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            node: NodeConfig::default(),
            coordinator: CoordinatorConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, file and environment.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("MINICOORD_CONFIG").unwrap_or_else(|_| "minicoord.toml".to_string());

        let config: Self = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("MINICOORD")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id must not be empty".into()));
        }
        if self.node.set_name.is_empty() || self.node.hosts.is_empty() {
            return Err(Error::InvalidConfig(
                "node.set_name and node.hosts are required".into(),
            ));
        }
        self.coordinator.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.coordinator.garbage_collection_delay(),
            Duration::from_secs(900)
        );
        assert_eq!(config.node.connection_string(), "recipient/localhost:7000");
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let coordinator = CoordinatorConfig {
            retry_initial_backoff_ms: 5_000,
            retry_max_backoff_ms: 10,
            ..Default::default()
        };
        assert!(matches!(
            coordinator.validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unbounded_gc_delay_rejected() {
        let mut coordinator = CoordinatorConfig {
            garbage_collection_delay_ms: 10_u64.pow(16),
            ..Default::default()
        };
        assert!(matches!(
            coordinator.validate(),
            Err(Error::InvalidConfig(_))
        ));

        coordinator.garbage_collection_delay_ms = MAX_GARBAGE_COLLECTION_DELAY_MS;
        assert!(coordinator.validate().is_ok());
    }
}
