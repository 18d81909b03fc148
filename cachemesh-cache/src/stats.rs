use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time statistics snapshot for one cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub evictions_capacity: u64,
    pub evictions_memory: u64,
    pub evictions_ttl: u64,
    pub evictions_explicit: u64,
    pub size: usize,
    pub memory_used_bytes: usize,
    pub last_updated: DateTime<Utc>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
