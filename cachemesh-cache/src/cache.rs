// One named cache: storage, TTL, eviction to fit, statistics
// Thread-safe; callers never observe expired entries

use crate::entry::CacheEntry;
use crate::stats::CacheStats;
use bytes::Bytes;
use cachemesh_core::config::CacheConfiguration;
use cachemesh_core::types::{EvictionPolicy, ReplicationMode};
use cachemesh_core::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why an entry was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Capacity,
    Memory,
    Ttl,
    Explicit,
}

#[derive(Debug)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions_capacity: u64,
    evictions_memory: u64,
    evictions_ttl: u64,
    evictions_explicit: u64,
    memory_used_bytes: usize,
    last_updated: DateTime<Utc>,
}

impl Counters {
    fn new() -> Self {
        Self {
            hits: 0,
            misses: 0,
            evictions_capacity: 0,
            evictions_memory: 0,
            evictions_ttl: 0,
            evictions_explicit: 0,
            memory_used_bytes: 0,
            last_updated: Utc::now(),
        }
    }

    fn record_eviction(&mut self, reason: EvictionReason) {
        match reason {
            EvictionReason::Capacity => self.evictions_capacity += 1,
            EvictionReason::Memory => self.evictions_memory += 1,
            EvictionReason::Ttl => self.evictions_ttl += 1,
            EvictionReason::Explicit => self.evictions_explicit += 1,
        }
        self.last_updated = Utc::now();
    }
}

/// A named cache bucket
pub struct Cache {
    name: String,
    config: RwLock<CacheConfiguration>,
    entries: DashMap<String, CacheEntry, ahash::RandomState>,
    counters: RwLock<Counters>,
    version: AtomicU64,
}

impl Cache {
    pub fn new(name: impl Into<String>, config: CacheConfiguration) -> Self {
        Self {
            name: name.into(),
            config: RwLock::new(config),
            entries: DashMap::with_hasher(ahash::RandomState::new()),
            counters: RwLock::new(Counters::new()),
            version: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn replication_mode(&self) -> ReplicationMode {
        self.config.read().replication_mode
    }

    pub fn configuration(&self) -> CacheConfiguration {
        self.config.read().clone()
    }

    /// Replace the policy; retained entries are re-evicted to fit the new caps
    pub fn configure(&self, config: CacheConfiguration) {
        *self.config.write() = config.clone();
        self.evict_to_fit(&config);
    }

    /// Lookup; expired entries are removed, counted as eviction(ttl) and a miss
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired(now) {
                    true
                } else {
                    entry.last_accessed = now;
                    entry.access_count += 1;
                    let value = entry.value.clone();
                    drop(entry);
                    let mut counters = self.counters.write();
                    counters.hits += 1;
                    counters.last_updated = Utc::now();
                    return Some(value);
                }
            }
            None => false,
        };

        if expired {
            self.remove_entry(key, EvictionReason::Ttl);
        }
        let mut counters = self.counters.write();
        counters.misses += 1;
        counters.last_updated = Utc::now();
        None
    }

    /// Insert or overwrite, then evict to fit; returns the entry's version
    pub fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        origin_node: &str,
    ) -> Result<u64> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let config = self.config.read().clone();
        let ttl = ttl.unwrap_or_else(|| config.default_ttl());
        let entry = CacheEntry::new(value, ttl, origin_node.to_string(), version);
        self.store(key, entry, &config)?;
        Ok(version)
    }

    /// Apply a replicated write from a peer; skips strictly-older versions
    pub fn apply_remote(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        origin_node: &str,
        version: u64,
    ) -> Result<bool> {
        if let Some(existing) = self.entries.get(key) {
            if version < existing.version {
                debug!(
                    cache = %self.name,
                    key,
                    incoming = version,
                    local = existing.version,
                    "skipping stale replicated write"
                );
                return Ok(false);
            }
        }

        // Keep the local counter ahead of everything observed
        self.version.fetch_max(version, Ordering::SeqCst);
        let config = self.config.read().clone();
        let entry = CacheEntry::new(value, ttl, origin_node.to_string(), version);
        self.store(key, entry, &config)?;
        Ok(true)
    }

    fn store(&self, key: &str, entry: CacheEntry, config: &CacheConfiguration) -> Result<()> {
        if config.max_entries == 0 {
            return Err(Error::Backpressure(format!(
                "cache '{}' admits no entries",
                self.name
            )));
        }
        let cost = entry.cost(key);
        if cost > config.memory_cap_bytes {
            return Err(Error::Backpressure(format!(
                "entry of {} bytes exceeds the {} byte memory cap of cache '{}'",
                cost, config.memory_cap_bytes, self.name
            )));
        }

        let old = self.entries.insert(key.to_string(), entry);
        {
            let mut counters = self.counters.write();
            if let Some(old) = &old {
                counters.memory_used_bytes =
                    counters.memory_used_bytes.saturating_sub(old.cost(key));
            }
            counters.memory_used_bytes += cost;
            counters.last_updated = Utc::now();
        }

        self.evict_to_fit(config);
        Ok(())
    }

    /// Remove one key; counted as eviction(explicit) when present
    pub fn invalidate(&self, key: &str) -> bool {
        self.remove_entry(key, EvictionReason::Explicit)
    }

    /// Clear every entry
    pub fn invalidate_all(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        let mut counters = self.counters.write();
        counters.evictions_explicit += removed as u64;
        counters.memory_used_bytes = 0;
        counters.last_updated = Utc::now();
        removed
    }

    /// Remove every key starting with `prefix`
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in matching {
            if self.remove_entry(&key, EvictionReason::Explicit) {
                removed += 1;
            }
        }
        removed
    }

    /// Snapshot of matching keys; order unspecified
    pub fn keys(&self, prefix: Option<&str>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| prefix.map_or(true, |p| e.key().starts_with(p)))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let counters = self.counters.read();
        CacheStats {
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions_capacity
                + counters.evictions_memory
                + counters.evictions_ttl
                + counters.evictions_explicit,
            evictions_capacity: counters.evictions_capacity,
            evictions_memory: counters.evictions_memory,
            evictions_ttl: counters.evictions_ttl,
            evictions_explicit: counters.evictions_explicit,
            size: self.entries.len(),
            memory_used_bytes: counters.memory_used_bytes,
            last_updated: counters.last_updated,
        }
    }

    fn remove_entry(&self, key: &str, reason: EvictionReason) -> bool {
        match self.entries.remove(key) {
            Some((key, entry)) => {
                let mut counters = self.counters.write();
                counters.memory_used_bytes =
                    counters.memory_used_bytes.saturating_sub(entry.cost(&key));
                counters.record_eviction(reason);
                true
            }
            None => false,
        }
    }

    /// Remove victims until both the size and memory invariants hold
    fn evict_to_fit(&self, config: &CacheConfiguration) {
        loop {
            let size = self.entries.len();
            let memory = self.counters.read().memory_used_bytes;
            if size <= config.max_entries && memory <= config.memory_cap_bytes {
                break;
            }

            // Expired entries go first, whatever the policy
            let now = Instant::now();
            let expired = self
                .entries
                .iter()
                .find(|e| e.value().is_expired(now))
                .map(|e| e.key().clone());
            if let Some(key) = expired {
                self.remove_entry(&key, EvictionReason::Ttl);
                continue;
            }

            let reason = if size > config.max_entries {
                EvictionReason::Capacity
            } else {
                EvictionReason::Memory
            };

            match self.select_victim(config.eviction_policy) {
                Some(key) => {
                    debug!(cache = %self.name, key = %key, ?reason, "evicting entry");
                    self.remove_entry(&key, reason);
                }
                None => {
                    warn!(cache = %self.name, "eviction found no victim while over capacity");
                    break;
                }
            }
        }
    }

    fn select_victim(&self, policy: EvictionPolicy) -> Option<String> {
        match policy {
            EvictionPolicy::Lru => {
                let mut best: Option<(Instant, Instant, String)> = None;
                for e in self.entries.iter() {
                    let cand = (e.last_accessed, e.created_at, e.key().clone());
                    if best.as_ref().map_or(true, |b| cand < *b) {
                        best = Some(cand);
                    }
                }
                best.map(|(_, _, key)| key)
            }
            EvictionPolicy::Lfu => {
                let mut best: Option<(u64, Instant, String)> = None;
                for e in self.entries.iter() {
                    let cand = (e.access_count, e.last_accessed, e.key().clone());
                    if best.as_ref().map_or(true, |b| cand < *b) {
                        best = Some(cand);
                    }
                }
                best.map(|(_, _, key)| key)
            }
            EvictionPolicy::TtlOnly => {
                let mut best: Option<(Instant, String)> = None;
                for e in self.entries.iter() {
                    let cand = (e.expires_at, e.key().clone());
                    if best.as_ref().map_or(true, |b| cand < *b) {
                        best = Some(cand);
                    }
                }
                best.map(|(_, key)| key)
            }
        }
    }
}
