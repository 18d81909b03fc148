// Exclusive owner of all named caches on a node

use crate::cache::Cache;
use crate::stats::CacheStats;
use bytes::Bytes;
use cachemesh_core::config::CacheConfiguration;
use cachemesh_core::types::ReplicationMode;
use cachemesh_core::{Error, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Routes operations to named caches; operations on unconfigured names fail
pub struct CacheManager {
    node_id: String,
    caches: DashMap<String, Arc<Cache>>,
}

impl CacheManager {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            caches: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Create a cache or replace an existing cache's policy (entries retained)
    pub fn configure_cache(&self, name: &str, config: CacheConfiguration) {
        match self.caches.get(name) {
            Some(cache) => {
                info!(cache = name, "reconfiguring cache");
                cache.configure(config);
            }
            None => {
                info!(cache = name, "creating cache");
                self.caches
                    .insert(name.to_string(), Arc::new(Cache::new(name, config)));
            }
        }
    }

    pub fn cache(&self, name: &str) -> Result<Arc<Cache>> {
        self.caches
            .get(name)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str, key: &str) -> Result<Option<Bytes>> {
        Ok(self.cache(name)?.get(key))
    }

    pub fn put(&self, name: &str, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<u64> {
        self.cache(name)?.put(key, value, ttl, &self.node_id)
    }

    pub fn apply_remote(
        &self,
        name: &str,
        key: &str,
        value: Bytes,
        ttl: Duration,
        origin_node: &str,
        version: u64,
    ) -> Result<bool> {
        self.cache(name)?
            .apply_remote(key, value, ttl, origin_node, version)
    }

    pub fn invalidate(&self, name: &str, key: &str) -> Result<bool> {
        Ok(self.cache(name)?.invalidate(key))
    }

    pub fn invalidate_all(&self, name: &str) -> Result<usize> {
        Ok(self.cache(name)?.invalidate_all())
    }

    pub fn invalidate_by_prefix(&self, name: &str, prefix: &str) -> Result<usize> {
        Ok(self.cache(name)?.invalidate_by_prefix(prefix))
    }

    pub fn keys(&self, name: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        Ok(self.cache(name)?.keys(prefix))
    }

    pub fn stats(&self, name: &str) -> Result<CacheStats> {
        Ok(self.cache(name)?.stats())
    }

    pub fn replication_mode(&self, name: &str) -> Result<ReplicationMode> {
        Ok(self.cache(name)?.replication_mode())
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }

    /// Per-cache statistics for the admin surface
    pub fn stats_snapshot(&self) -> HashMap<String, CacheStats> {
        self.caches
            .iter()
            .map(|e| (e.key().clone(), e.value().stats()))
            .collect()
    }
}
