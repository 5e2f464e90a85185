//! Configuration module for the in-process cluster
//!
//! Supports YAML configuration files with module-based organization

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Nodes of the cluster
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeConfig>,
    /// Indices created at bootstrap
    #[serde(default)]
    pub indices: Vec<IndexConfig>,
    /// Persistent cluster settings, flat `key: value`
    #[serde(default)]
    pub allocation: BTreeMap<String, String>,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig::default(),
            nodes: default_nodes(),
            indices: Vec::new(),
            allocation: BTreeMap::new(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Check the cluster description for inconsistencies
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("at least one node is required".to_string()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(ConfigError::Invalid("node id must not be empty".to_string()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id [{}]", node.id)));
            }
        }
        if !self.nodes.iter().any(|n| n.master) {
            return Err(ConfigError::Invalid("no master-eligible node".to_string()));
        }
        for index in &self.indices {
            if index.shards == 0 {
                return Err(ConfigError::Invalid(format!("index [{}] must have at least one shard", index.name)));
            }
        }
        Ok(())
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name
    #[serde(default = "default_cluster_name")]
    pub name: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID
    pub id: String,
    /// Transport address
    #[serde(default = "default_address")]
    pub address: String,
    /// Custom attributes used by allocation filters
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Master-eligible
    #[serde(default = "default_true")]
    pub master: bool,
    /// Holds shard data
    #[serde(default = "default_true")]
    pub data: bool,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: default_address(),
            attributes: BTreeMap::new(),
            master: true,
            data: true,
        }
    }
}

/// Index created at bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub name: String,
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Index settings such as `index.routing.allocation.require.rack`
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_cluster_name() -> String {
    "local-cluster".to_string()
}

fn default_nodes() -> Vec<NodeConfig> {
    vec![NodeConfig::new("node-1"), NodeConfig::new("node-2"), NodeConfig::new("node-3")]
}

fn default_address() -> String {
    "127.0.0.1:9300".to_string()
}

fn default_true() -> bool {
    true
}

fn default_shards() -> u32 {
    1
}

fn default_replicas() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
