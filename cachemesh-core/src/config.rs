// Configuration for a CacheMesh node
// Cluster membership, communication, and per-cache policy resolution

use crate::types::{EvictionPolicy, PeerAddress, PersistenceMode, ReplicationMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Unreadable(String),

    #[error("failed to parse configuration: {0}")]
    Unparseable(String),

    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Peer discovery mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryType {
    Static,
    Multicast,
}

/// Peer discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(rename = "type", default = "default_discovery_type")]
    pub discovery_type: DiscoveryType,
    /// Comma-separated `host:port` list for static discovery
    #[serde(default)]
    pub static_peers: String,
}

fn default_discovery_type() -> DiscoveryType {
    DiscoveryType::Static
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_type: DiscoveryType::Static,
            static_peers: String::new(),
        }
    }
}

/// Cluster coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Identity of this node; synthesized when empty
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// TCP port for peer-to-peer messages
    #[serde(default = "default_communication_port")]
    pub communication_port: u16,
    /// Fire-and-forget broadcast dispatch when true
    #[serde(default = "default_async_broadcast")]
    pub async_broadcast: bool,
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}

fn default_communication_port() -> u16 {
    7600
}

fn default_async_broadcast() -> bool {
    true
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            discovery: DiscoveryConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            communication_port: default_communication_port(),
            async_broadcast: default_async_broadcast(),
        }
    }
}

impl ClusterConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Parsed static peer list
    pub fn static_peers(&self) -> Result<Vec<PeerAddress>, ConfigError> {
        let mut peers = Vec::new();
        for part in self.discovery.static_peers.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let addr = PeerAddress::parse(part).map_err(ConfigError::Invalid)?;
            peers.push(addr);
        }
        Ok(peers)
    }
}

/// Defaults applied to caches without explicit overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDefaults {
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_eviction_policy")]
    pub default_eviction_policy: EvictionPolicy,
    #[serde(default = "default_max_entries")]
    pub default_max_entries: usize,
    #[serde(default = "default_memory_cap_mb")]
    pub default_memory_cap_mb: usize,
}

fn default_ttl_ms() -> u64 {
    300_000
}

fn default_eviction_policy() -> EvictionPolicy {
    EvictionPolicy::Lru
}

fn default_max_entries() -> usize {
    10_000
}

fn default_memory_cap_mb() -> usize {
    64
}

impl Default for CacheDefaults {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            default_eviction_policy: default_eviction_policy(),
            default_max_entries: default_max_entries(),
            default_memory_cap_mb: default_memory_cap_mb(),
        }
    }
}

/// Per-named-cache policy overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheOverrides {
    pub ttl_ms: Option<u64>,
    pub eviction_policy: Option<EvictionPolicy>,
    pub max_entries: Option<usize>,
    pub memory_cap_mb: Option<usize>,
    pub replication_mode: Option<ReplicationMode>,
    pub persistence_mode: Option<PersistenceMode>,
}

/// Effective policy for one named cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfiguration {
    pub default_ttl_ms: u64,
    pub eviction_policy: EvictionPolicy,
    pub max_entries: usize,
    pub memory_cap_bytes: usize,
    pub replication_mode: ReplicationMode,
    pub persistence_mode: PersistenceMode,
}

impl CacheConfiguration {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        CacheDefaults::default().resolve(&CacheOverrides::default())
    }
}

impl CacheDefaults {
    /// Merge overrides on top of the node defaults
    pub fn resolve(&self, overrides: &CacheOverrides) -> CacheConfiguration {
        CacheConfiguration {
            default_ttl_ms: overrides.ttl_ms.unwrap_or(self.default_ttl_ms),
            eviction_policy: overrides
                .eviction_policy
                .unwrap_or(self.default_eviction_policy),
            max_entries: overrides.max_entries.unwrap_or(self.default_max_entries),
            memory_cap_bytes: overrides
                .memory_cap_mb
                .unwrap_or(self.default_memory_cap_mb)
                * 1024
                * 1024,
            replication_mode: overrides.replication_mode.unwrap_or(ReplicationMode::None),
            persistence_mode: overrides.persistence_mode.unwrap_or(PersistenceMode::None),
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub cache_defaults: CacheDefaults,
    /// Named caches configured at startup
    #[serde(default)]
    pub caches: HashMap<String, CacheOverrides>,
}

impl NodeConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(format!("{}: {}", path, e)))?;
        Self::from_str(&content)
    }

    /// Parse configuration content. A JSON document is recognized by its
    /// leading brace and its parse errors reported directly; anything else
    /// is read as TOML, falling back to YAML with both errors reported.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim_start().starts_with('{') {
            return serde_json::from_str(content)
                .map_err(|e| ConfigError::Unparseable(format!("json: {}", e)));
        }

        let toml_error = match toml::from_str(content) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        };
        serde_yaml::from_str(content).map_err(|yaml_error| {
            ConfigError::Unparseable(format!("toml: {}; yaml: {}", toml_error, yaml_error))
        })
    }

    /// Apply environment variable overrides
    pub fn apply_env(&mut self) {
        if let Ok(node_id) = std::env::var("CACHEMESH_NODE_ID") {
            self.cluster.node_id = node_id;
        }

        if let Ok(port) = std::env::var("CACHEMESH_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.cluster.communication_port = p;
            }
        }

        if let Ok(peers) = std::env::var("CACHEMESH_PEERS") {
            self.cluster.discovery.static_peers = peers;
        }
    }

    /// Validate configuration; startup must fail on errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "cluster.heartbeat_interval_ms must be > 0".to_string(),
            ));
        }

        if self.cluster.heartbeat_timeout_ms <= self.cluster.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "cluster.heartbeat_timeout_ms must be greater than the heartbeat interval"
                    .to_string(),
            ));
        }

        if self.cluster.discovery.discovery_type == DiscoveryType::Multicast {
            return Err(ConfigError::Invalid(
                "cluster.discovery.type 'multicast' is not supported; use 'static'".to_string(),
            ));
        }

        let peers = self.cluster.static_peers()?;
        if !peers.is_empty() && self.cluster.communication_port == 0 {
            return Err(ConfigError::Invalid(
                "cluster.communication_port cannot be 0 when peers are configured".to_string(),
            ));
        }

        if self.cache_defaults.default_max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache_defaults.default_max_entries must be > 0".to_string(),
            ));
        }

        if self.cache_defaults.default_memory_cap_mb == 0 {
            return Err(ConfigError::Invalid(
                "cache_defaults.default_memory_cap_mb must be > 0".to_string(),
            ));
        }

        for (name, overrides) in &self.caches {
            if overrides.max_entries == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "cache '{}': max_entries must be > 0",
                    name
                )));
            }
            if overrides.memory_cap_mb == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "cache '{}': memory_cap_mb must be > 0",
                    name
                )));
            }
            match overrides.persistence_mode {
                None | Some(PersistenceMode::None) => {}
                Some(mode) => {
                    return Err(ConfigError::Invalid(format!(
                        "cache '{}': persistence mode {:?} is not implemented",
                        name, mode
                    )));
                }
            }
        }

        Ok(())
    }

    /// Effective policy for a named cache
    pub fn cache_configuration(&self, name: &str) -> CacheConfiguration {
        let overrides = self.caches.get(name).cloned().unwrap_or_default();
        self.cache_defaults.resolve(&overrides)
    }

    /// Node id, synthesizing one from the host and startup time when unset
    pub fn effective_node_id(&self) -> String {
        if !self.cluster.node_id.is_empty() {
            return self.cluster.node_id.clone();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}",
            host,
            crate::types::unix_millis(),
            &suffix[..8]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interval_must_be_below_timeout() {
        let mut config = NodeConfig::default();
        config.cluster.heartbeat_interval_ms = 20_000;
        config.cluster.heartbeat_timeout_ms = 15_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multicast_rejected() {
        let mut config = NodeConfig::default();
        config.cluster.discovery.discovery_type = DiscoveryType::Multicast;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_peer_list_rejected() {
        let mut config = NodeConfig::default();
        config.cluster.discovery.static_peers = "127.0.0.1:7601,not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_static_peers_parsed() {
        let mut config = NodeConfig::default();
        config.cluster.discovery.static_peers = "127.0.0.1:7601, 127.0.0.1:7602".to_string();
        let peers = config.cluster.static_peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].as_str(), "127.0.0.1:7602");
    }

    #[test]
    fn test_persistence_modes_rejected() {
        let mut config = NodeConfig::default();
        config.caches.insert(
            "sessions".to_string(),
            CacheOverrides {
                persistence_mode: Some(PersistenceMode::WriteThrough),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_configuration_resolution() {
        let mut config = NodeConfig::default();
        config.caches.insert(
            "users".to_string(),
            CacheOverrides {
                max_entries: Some(42),
                replication_mode: Some(ReplicationMode::Replicate),
                ..Default::default()
            },
        );

        let users = config.cache_configuration("users");
        assert_eq!(users.max_entries, 42);
        assert_eq!(users.replication_mode, ReplicationMode::Replicate);
        assert_eq!(users.default_ttl_ms, config.cache_defaults.default_ttl_ms);

        let other = config.cache_configuration("other");
        assert_eq!(other.max_entries, config.cache_defaults.default_max_entries);
        assert_eq!(other.replication_mode, ReplicationMode::None);
    }

    #[test]
    fn test_from_str_toml() {
        let content = r#"
[cluster]
node_id = "node-1"
communication_port = 7700

[cluster.discovery]
type = "static"
static_peers = "127.0.0.1:7701"

[cache_defaults]
default_max_entries = 100
"#;
        let config = NodeConfig::from_str(content).unwrap();
        assert_eq!(config.cluster.node_id, "node-1");
        assert_eq!(config.cluster.communication_port, 7700);
        assert_eq!(config.cache_defaults.default_max_entries, 100);
    }

    #[test]
    fn test_from_str_json() {
        let content = r#"{"cluster": {"node_id": "node-2"}}"#;
        let config = NodeConfig::from_str(content).unwrap();
        assert_eq!(config.cluster.node_id, "node-2");
    }

    #[test]
    fn test_effective_node_id_synthesized() {
        let config = NodeConfig::default();
        let id = config.effective_node_id();
        assert!(!id.is_empty());
        // Two syntheses never collide
        assert_ne!(id, config.effective_node_id());
    }
}
