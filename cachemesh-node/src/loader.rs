use async_trait::async_trait;
use bytes::Bytes;
use cachemesh_core::Result;

/// Source of truth consulted on cache misses during prefetch
#[async_trait]
pub trait CacheLoader: Send + Sync {
    async fn load(&self, key: &str) -> Result<Bytes>;
}
