pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfiguration, CacheOverrides, ClusterConfig, ConfigError, NodeConfig};
pub use error::{Error, Result};
pub use types::{EvictionPolicy, PeerAddress, PersistenceMode, ReplicationMode};
