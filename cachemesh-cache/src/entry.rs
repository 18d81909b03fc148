use bytes::Bytes;
use std::time::{Duration, Instant};

/// Fixed bookkeeping overhead charged per entry on top of key and payload
pub(crate) const ENTRY_OVERHEAD_BYTES: usize = 128;

/// One stored value with its access metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Bytes,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
    /// Node that produced this entry
    pub origin_node: String,
    /// Monotonic per-cache counter used for conflict ordering
    pub version: u64,
}

impl CacheEntry {
    pub fn new(value: Bytes, ttl: Duration, origin_node: String, version: u64) -> Self {
        let now = Instant::now();
        // expires_at must stay strictly after created_at
        let ttl = ttl.max(Duration::from_millis(1));
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            // Insertion counts as the first access
            access_count: 1,
            origin_node,
            version,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Coarse, repeatable memory estimate for this entry under `key`
    pub fn cost(&self, key: &str) -> usize {
        ENTRY_OVERHEAD_BYTES + key.len() + self.value.len()
    }
}
