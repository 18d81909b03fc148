// Tests for the cache core: storage, TTL, statistics, prefix operations

use bytes::Bytes;
use cachemesh_cache::{Cache, CacheManager};
use cachemesh_core::config::CacheConfiguration;
use cachemesh_core::types::EvictionPolicy;
use cachemesh_core::Error;
use std::time::Duration;

fn config(max_entries: usize) -> CacheConfiguration {
    let mut config = CacheConfiguration::default();
    config.max_entries = max_entries;
    config.eviction_policy = EvictionPolicy::Lru;
    config
}

#[test]
fn test_put_then_get_within_ttl() {
    let cache = Cache::new("test", config(10));
    cache
        .put("k1", Bytes::from_static(b"v"), Some(Duration::from_secs(60)), "node-1")
        .unwrap();
    assert_eq!(cache.get("k1"), Some(Bytes::from_static(b"v")));
}

#[test]
fn test_second_put_wins() {
    let cache = Cache::new("test", config(10));
    cache
        .put("k1", Bytes::from_static(b"v1"), None, "node-1")
        .unwrap();
    cache
        .put("k1", Bytes::from_static(b"v2"), None, "node-1")
        .unwrap();
    assert_eq!(cache.get("k1"), Some(Bytes::from_static(b"v2")));
}

#[test]
fn test_ttl_expiry_is_a_miss_and_ttl_eviction() {
    let cache = Cache::new("test", config(10));
    cache
        .put("k1", Bytes::from_static(b"v"), Some(Duration::from_millis(50)), "node-1")
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let before = cache.stats();
    assert_eq!(cache.get("k1"), None);
    let after = cache.stats();

    assert_eq!(after.misses, before.misses + 1);
    assert_eq!(after.evictions_ttl, before.evictions_ttl + 1);
    assert_eq!(after.size, 0);
}

#[test]
fn test_double_invalidate_matches_single() {
    let cache = Cache::new("test", config(10));
    cache
        .put("k1", Bytes::from_static(b"v"), None, "node-1")
        .unwrap();

    assert!(cache.invalidate("k1"));
    let once = cache.stats();

    assert!(!cache.invalidate("k1"));
    let twice = cache.stats();

    assert_eq!(once.evictions_explicit, twice.evictions_explicit);
    assert_eq!(once.size, twice.size);
}

#[test]
fn test_invalidate_all_clears_everything() {
    let cache = Cache::new("test", config(10));
    for i in 0..5 {
        cache
            .put(&format!("k{}", i), Bytes::from_static(b"v"), None, "node-1")
            .unwrap();
    }
    assert_eq!(cache.invalidate_all(), 5);
    assert!(cache.is_empty());
    assert_eq!(cache.stats().memory_used_bytes, 0);
}

#[test]
fn test_prefix_invalidation_and_keys() {
    let cache = Cache::new("test", config(10));
    for key in ["session:a", "session:b", "user:a"] {
        cache
            .put(key, Bytes::from_static(b"v"), None, "node-1")
            .unwrap();
    }

    let mut session_keys = cache.keys(Some("session:"));
    session_keys.sort();
    assert_eq!(session_keys, vec!["session:a", "session:b"]);

    assert_eq!(cache.invalidate_by_prefix("session:"), 2);
    assert_eq!(cache.keys(None), vec!["user:a"]);
}

#[test]
fn test_stats_track_hits_and_misses() {
    let cache = Cache::new("test", config(10));
    cache
        .put("k1", Bytes::from_static(b"v"), None, "node-1")
        .unwrap();

    cache.get("k1");
    cache.get("k1");
    cache.get("missing");

    let stats = cache.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.size, 1);
    assert!(stats.memory_used_bytes > 0);
}

#[test]
fn test_manager_routes_by_name() {
    let manager = CacheManager::new("node-1");
    manager.configure_cache("a", config(10));
    manager.configure_cache("b", config(10));

    manager
        .put("a", "k", Bytes::from_static(b"in-a"), None)
        .unwrap();
    assert_eq!(
        manager.get("a", "k").unwrap(),
        Some(Bytes::from_static(b"in-a"))
    );
    assert_eq!(manager.get("b", "k").unwrap(), None);
}

#[test]
fn test_manager_unknown_cache() {
    let manager = CacheManager::new("node-1");
    assert!(matches!(
        manager.keys("ghost", None),
        Err(Error::CacheNotFound(_))
    ));
    assert!(matches!(
        manager.stats("ghost"),
        Err(Error::CacheNotFound(_))
    ));
    assert!(matches!(
        manager.invalidate_all("ghost"),
        Err(Error::CacheNotFound(_))
    ));
}

#[test]
fn test_remote_apply_respects_versions() {
    let cache = Cache::new("test", config(10));
    assert!(cache
        .apply_remote("k", Bytes::from_static(b"v5"), Duration::from_secs(60), "node-2", 5)
        .unwrap());
    // Older update from elsewhere loses
    assert!(!cache
        .apply_remote("k", Bytes::from_static(b"v2"), Duration::from_secs(60), "node-3", 2)
        .unwrap());
    // Same-or-newer version wins by arrival order
    assert!(cache
        .apply_remote("k", Bytes::from_static(b"v5b"), Duration::from_secs(60), "node-3", 5)
        .unwrap());
    assert_eq!(cache.get("k"), Some(Bytes::from_static(b"v5b")));
}
