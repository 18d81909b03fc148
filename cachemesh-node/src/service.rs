// Public cache façade
// Reads and writes go to the local cache manager; writes fan out to peers
// according to the cache's replication mode. Broadcast failures are logged
// and counted by the sender, never surfaced to callers.

use crate::loader::CacheLoader;
use crate::single_flight::{self, Claim, LoadOutcome, LoadTable};
use bytes::Bytes;
use cachemesh_cache::{CacheManager, CacheStats};
use cachemesh_cluster::ClusterCoordinator;
use cachemesh_core::types::ReplicationMode;
use cachemesh_core::{Error, Result};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct CacheService {
    manager: Arc<CacheManager>,
    coordinator: Arc<ClusterCoordinator>,
    loads: LoadTable,
    loaders: DashMap<String, Arc<dyn CacheLoader>>,
}

impl CacheService {
    pub fn new(manager: Arc<CacheManager>, coordinator: Arc<ClusterCoordinator>) -> Self {
        Self {
            manager,
            coordinator,
            loads: LoadTable::new(),
            loaders: DashMap::new(),
        }
    }

    pub fn get(&self, cache_name: &str, key: &str) -> Result<Option<Bytes>> {
        self.manager.get(cache_name, key)
    }

    /// Read through the cache, running `loader` on a miss. Concurrent
    /// callers for the same key share a single loader execution; all of
    /// them observe its outcome.
    pub async fn get_or_load<F, Fut>(
        &self,
        cache_name: &str,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        // Fast path
        if let Some(value) = self.manager.get(cache_name, key)? {
            return Ok(value);
        }

        let mut loader = Some(loader);
        loop {
            match self.loads.claim(cache_name, key) {
                Claim::Follower(rx) => match single_flight::wait(rx).await {
                    Some(LoadOutcome::Resolved(value)) => return Ok(value),
                    Some(LoadOutcome::Failed(message)) => return Err(Error::CacheLoad(message)),
                    // Leader vanished without resolving; claim again
                    None => continue,
                },
                Claim::Leader(guard) => {
                    // Double-check now that we hold the key
                    match self.manager.get(cache_name, key) {
                        Ok(Some(value)) => {
                            guard.resolve(LoadOutcome::Resolved(value.clone()));
                            return Ok(value);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            guard.resolve(LoadOutcome::Failed(e.to_string()));
                            return Err(e);
                        }
                    }

                    let run = match loader.take() {
                        Some(run) => run,
                        None => {
                            let message = "loader already consumed".to_string();
                            guard.resolve(LoadOutcome::Failed(message.clone()));
                            return Err(Error::CacheLoad(message));
                        }
                    };

                    match run().await {
                        Ok(value) => {
                            if let Err(e) =
                                self.put_internal(cache_name, key, value.clone(), ttl).await
                            {
                                guard.resolve(LoadOutcome::Failed(e.to_string()));
                                return Err(e);
                            }
                            guard.resolve(LoadOutcome::Resolved(value.clone()));
                            return Ok(value);
                        }
                        Err(e) => {
                            let message = e.to_string();
                            guard.resolve(LoadOutcome::Failed(message.clone()));
                            return Err(Error::CacheLoad(message));
                        }
                    }
                }
            }
        }
    }

    /// Store locally, then fan out per the cache's replication mode
    pub async fn put(
        &self,
        cache_name: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.put_internal(cache_name, key, value, ttl).await
    }

    /// Each entry follows the `put` contract; no cross-entry atomicity
    pub async fn put_all(
        &self,
        cache_name: &str,
        entries: Vec<(String, Bytes)>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        for (key, value) in entries {
            self.put_internal(cache_name, &key, value, ttl).await?;
        }
        Ok(())
    }

    async fn put_internal(
        &self,
        cache_name: &str,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let cache = self.manager.cache(cache_name)?;
        let mode = cache.replication_mode();
        // Local store happens before any broadcast
        let version = cache.put(key, value.clone(), ttl, self.manager.node_id())?;

        match mode {
            ReplicationMode::None => {}
            ReplicationMode::Invalidate => {
                self.coordinator
                    .broadcast_invalidation(cache_name, Some(key))
                    .await;
            }
            ReplicationMode::Replicate => {
                let ttl = ttl.unwrap_or_else(|| cache.configuration().default_ttl());
                self.coordinator
                    .broadcast_replication(cache_name, key, value, ttl, version)
                    .await;
            }
        }
        Ok(())
    }

    /// Remove locally; propagates whenever the cache replicates at all
    pub async fn invalidate(&self, cache_name: &str, key: &str) -> Result<bool> {
        let mode = self.manager.replication_mode(cache_name)?;
        let removed = self.manager.invalidate(cache_name, key)?;
        if mode != ReplicationMode::None {
            self.coordinator
                .broadcast_invalidation(cache_name, Some(key))
                .await;
        }
        Ok(removed)
    }

    pub async fn invalidate_all(&self, cache_name: &str) -> Result<usize> {
        let mode = self.manager.replication_mode(cache_name)?;
        let removed = self.manager.invalidate_all(cache_name)?;
        if mode != ReplicationMode::None {
            self.coordinator
                .broadcast_invalidation(cache_name, None)
                .await;
        }
        Ok(removed)
    }

    pub fn invalidate_by_prefix(&self, cache_name: &str, prefix: &str) -> Result<usize> {
        self.manager.invalidate_by_prefix(cache_name, prefix)
    }

    /// Register the loader consulted by `prefetch` for this cache
    pub fn register_loader(&self, cache_name: &str, loader: Arc<dyn CacheLoader>) {
        self.loaders.insert(cache_name.to_string(), loader);
    }

    /// Best-effort warm-up through the cache's registered loader; a no-op
    /// when none is registered. Returns how many keys were loaded.
    pub async fn prefetch(&self, cache_name: &str, keys: &[String]) -> Result<usize> {
        // Fail on unknown caches before touching the loader
        let _ = self.manager.cache(cache_name)?;
        let loader = match self.loaders.get(cache_name) {
            Some(loader) => Arc::clone(loader.value()),
            None => {
                debug!(cache = cache_name, "prefetch skipped: no loader registered");
                return Ok(0);
            }
        };

        let mut loaded = 0;
        for key in keys {
            if self.manager.get(cache_name, key)?.is_some() {
                continue;
            }
            let loader = Arc::clone(&loader);
            let owned_key = key.clone();
            let result = self
                .get_or_load(cache_name, key, None, move || async move {
                    loader.load(&owned_key).await
                })
                .await;
            match result {
                Ok(_) => loaded += 1,
                Err(e) => warn!(cache = cache_name, key = %key, "prefetch failed: {}", e),
            }
        }
        Ok(loaded)
    }

    pub fn keys(&self, cache_name: &str, prefix: Option<&str>) -> Result<Vec<String>> {
        self.manager.keys(cache_name, prefix)
    }

    pub fn stats(&self, cache_name: &str) -> Result<CacheStats> {
        self.manager.stats(cache_name)
    }
}
