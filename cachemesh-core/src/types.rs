use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network address of a peer node (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("peer address '{}' is not host:port", s))?;
        if host.is_empty() {
            return Err(format!("peer address '{}' has an empty host", s));
        }
        port.parse::<u16>()
            .map_err(|_| format!("peer address '{}' has an invalid port", s))?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn port(&self) -> u16 {
        // Validated at construction
        self.0
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse::<u16>().ok())
            .unwrap_or(0)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Victim selection rule when a cache exceeds its capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionPolicy {
    Lru,     // Least recently used
    Lfu,     // Least frequently used
    TtlOnly, // Nearest expiry
}

/// What peers observe when a local cache mutates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMode {
    None,       // Local only
    Invalidate, // Broadcast delete signal
    Replicate,  // Broadcast the new value
}

/// Persistence mode (only NONE is implemented)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistenceMode {
    None,
    WriteThrough,
    WriteBack,
}

/// Milliseconds since the unix epoch
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
