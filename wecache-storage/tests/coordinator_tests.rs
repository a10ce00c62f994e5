//! End-to-end behaviour of the two-tier cache through its public API.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use regex::Regex;
use wecache_core::{CacheKey, FreshnessSignal, MemoryTierConfig};
use wecache_storage::cache::{CacheCoordinator, DiskTier, LmdbDiskCache, MemoryCache};
use wecache_test_utils::assertions::{assert_tier, assert_within_budget};
use wecache_test_utils::fixtures::{
    temp_coordinator, temp_coordinator_with, temp_disk_cache, test_config, TestCache, START_MS,
};
use wecache_test_utils::generators::{arb_pooled_key, arb_sized_value, arb_work_effort};
use wecache_test_utils::loaders::{CountingLoader, LoadError};
use wecache_test_utils::mocks::{FailingDiskTier, GatedDiskTier};
use wecache_test_utils::{
    string_of_encoded_size, CacheConfig, Clock, EntryMetadata, ManualClock, Tier, WorkEffort,
};

const HUNDRED: usize = 100;

fn value(fill: char) -> String {
    string_of_encoded_size(fill, HUNDRED)
}

// ============================================================================
// CAPACITY AND LRU ORDER
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_memory_never_exceeds_budget(
        writes in prop::collection::vec((arb_pooled_key(12), arb_sized_value(2..180)), 1..150),
    ) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let config = MemoryTierConfig {
            max_size_bytes: 500,
            max_age: Duration::from_secs(60),
        };
        let mut memory: MemoryCache<String> = MemoryCache::new(&config, clock);

        for (key, value) in writes {
            memory.set(&key, value, EntryMetadata::new());
            let stats = memory.stats();
            prop_assert!(stats.current_size <= stats.max_size);
            prop_assert_eq!(stats.entry_count as usize, memory.keys().len());
        }
    }

    #[test]
    fn prop_structured_values_roundtrip_through_memory(effort in arb_work_effort()) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let mut memory: MemoryCache<WorkEffort> =
            MemoryCache::new(&MemoryTierConfig::default(), clock);
        memory.set(&effort.id, effort.clone(), EntryMetadata::new());
        prop_assert_eq!(memory.get(&effort.id), Some(effort));
    }
}

#[tokio::test]
async fn test_lru_evicts_least_recently_used() {
    let TestCache { cache, .. } = temp_coordinator::<String>(300, Duration::from_secs(60));
    let loader = CountingLoader::new();

    for (key, fill) in [("A", 'a'), ("B", 'b'), ("C", 'c')] {
        cache.get(key, loader.returning(value(fill))).await.unwrap();
    }
    let read = cache.get_with_meta("A", loader.returning(value('z'))).await.unwrap();
    assert_tier(&read, Tier::Memory);

    cache.get("D", loader.returning(value('d'))).await.unwrap();

    assert!(!cache.memory_contains("B"));
    assert!(cache.memory_contains("A"));
    assert!(cache.memory_contains("C"));
    assert!(cache.memory_contains("D"));
    assert_eq!(cache.memory_stats().evictions, 1);
    assert_within_budget(&cache.memory_stats());
    assert_eq!(loader.calls(), 4);
}

#[tokio::test]
async fn test_evicted_entry_is_on_disk_when_get_returns() {
    let TestCache { cache, .. } = temp_coordinator::<String>(300, Duration::from_secs(60));
    let loader = CountingLoader::new();

    for (key, fill) in [("A", 'a'), ("B", 'b'), ("C", 'c')] {
        cache.get(key, loader.returning(value(fill))).await.unwrap();
    }
    cache.get("A", loader.returning(value('z'))).await.unwrap();
    cache.get("D", loader.returning(value('d'))).await.unwrap();

    // No flush: the eviction's write-back is applied before get(D) returns.
    let row = cache.disk().get("B").await.unwrap().expect("B demoted to disk");
    assert_eq!(row.decode_value::<String>().unwrap(), value('b'));
    assert_eq!(cache.stats().await.write_backs, 1);

    // And the coordinator serves it from disk without reloading.
    let read = cache.get_with_meta("B", loader.returning(value('x'))).await.unwrap();
    assert_tier(&read, Tier::Disk);
    assert_eq!(read.into_value(), value('b'));
    assert_eq!(loader.calls(), 4);
}

// ============================================================================
// EXPIRY
// ============================================================================

#[tokio::test]
async fn test_expired_entry_reloads() {
    let TestCache { cache, clock, .. } = temp_coordinator_with::<String, _>(|config| {
        config
            .with_memory_max_age(Duration::from_millis(50))
            .with_disk_max_age(Duration::from_millis(50))
    });
    let loader = CountingLoader::new();

    cache.get("k", loader.returning("v1".to_string())).await.unwrap();
    cache.flush().await.unwrap();
    clock.advance_ms(60);

    let read = cache.get_with_meta("k", loader.returning("v2".to_string())).await.unwrap();
    assert_tier(&read, Tier::Loader);
    assert_eq!(read.into_value(), "v2");
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_expiry_with_wall_clock() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = CacheConfig::new()
        .with_memory_max_age(Duration::from_millis(50))
        .with_disk_max_age(Duration::from_millis(50))
        .with_disk_path(dir.path())
        .with_map_size_mb(16)
        .with_cleanup_interval(None);
    let cache: CacheCoordinator<String> = CacheCoordinator::open(config).unwrap();
    let loader = CountingLoader::new();

    cache.get("k", loader.returning("v".to_string())).await.unwrap();
    cache.get("k", loader.returning("v".to_string())).await.unwrap();
    assert_eq!(loader.calls(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    cache.get("k", loader.returning("v".to_string())).await.unwrap();
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_disk_outlives_memory() {
    let TestCache { cache, clock, .. } = temp_coordinator_with::<String, _>(|config| {
        config
            .with_memory_max_age(Duration::from_millis(50))
            .with_disk_max_age(Duration::from_secs(3600))
    });
    let loader = CountingLoader::new();

    cache.get("k", loader.returning("v".to_string())).await.unwrap();
    cache.flush().await.unwrap();
    clock.advance_ms(60);

    let read = cache.get_with_meta("k", loader.returning("other".to_string())).await.unwrap();
    assert_tier(&read, Tier::Disk);
    assert_eq!(read.into_value(), "v");
    assert_eq!(loader.calls(), 1);
}

// ============================================================================
// PROMOTION
// ============================================================================

#[tokio::test]
async fn test_disk_hit_is_promoted() {
    let TestCache { cache, .. } = temp_coordinator::<WorkEffort>(4096, Duration::from_secs(60));
    let loader = CountingLoader::new();
    let effort = WorkEffort::new("WE-0042", "Rebuild index");

    let written = cache
        .disk()
        .set("efforts:42", &effort, EntryMetadata::with_etag("m1700000000000"))
        .unwrap();
    assert!(!cache.memory_contains("efforts:42"));

    let read = cache
        .get_with_meta("efforts:42", loader.returning(WorkEffort::new("x", "y")))
        .await
        .unwrap();
    assert_tier(&read, Tier::Disk);
    assert!(read.matches_etag("m1700000000000"));
    assert_eq!(read.cached_at_ms(), written.timestamp_ms);
    assert_eq!(read.value(), &effort);
    assert!(cache.memory_contains("efforts:42"));

    let again = cache
        .get_with_meta("efforts:42", loader.returning(WorkEffort::new("x", "y")))
        .await
        .unwrap();
    assert_tier(&again, Tier::Memory);
    assert!(again.matches_etag("m1700000000000"));

    assert_eq!(loader.calls(), 0);
    assert_eq!(cache.stats().await.promotions, 1);
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_invalidate_forces_exactly_one_reload() {
    let TestCache { cache, .. } = temp_coordinator::<String>(1024, Duration::from_secs(60));
    let loader = CountingLoader::new();

    cache.get("k", loader.returning("v1".to_string())).await.unwrap();
    cache.flush().await.unwrap();
    assert!(cache.disk().get("k").await.unwrap().is_some());

    assert!(cache.invalidate("k").await.unwrap());

    let value = cache.get("k", loader.returning("v2".to_string())).await.unwrap();
    assert_eq!(value, "v2");
    assert_eq!(loader.calls(), 2);

    cache.get("k", loader.returning("v3".to_string())).await.unwrap();
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_invalidate_without_flush_beats_queued_write() {
    let TestCache { cache, .. } = temp_coordinator::<String>(1024, Duration::from_secs(60));
    let loader = CountingLoader::new();

    // The put for "k" may still be queued when the invalidation arrives.
    cache.get("k", loader.returning("v1".to_string())).await.unwrap();
    cache.invalidate("k").await.unwrap();

    assert!(cache.disk().get("k").await.unwrap().is_none());
    cache.get("k", loader.returning("v2".to_string())).await.unwrap();
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_invalidate_reaches_demoted_entries() {
    let TestCache { cache, .. } = temp_coordinator::<String>(100, Duration::from_secs(60));
    let loader = CountingLoader::new();

    cache.get("A", loader.returning(value('a'))).await.unwrap();
    cache.get("B", loader.returning(value('b'))).await.unwrap();
    assert!(!cache.memory_contains("A"));

    cache.invalidate("A").await.unwrap();
    cache.get("A", loader.returning(value('a'))).await.unwrap();
    assert_eq!(loader.calls(), 3);
}

#[tokio::test]
async fn test_invalidate_missing_key() {
    let TestCache { cache, .. } = temp_coordinator::<String>(1024, Duration::from_secs(60));
    assert!(!cache.invalidate("never-cached").await.unwrap());
}

#[tokio::test]
async fn test_pattern_invalidation_is_memory_only() {
    let TestCache { cache, .. } = temp_coordinator::<String>(4096, Duration::from_secs(60));
    let loader = CountingLoader::new();

    let key_one = CacheKey::builder("efforts").param("id", 1).build().to_string();
    let key_two = CacheKey::builder("efforts").param("id", 2).build().to_string();
    let other = CacheKey::builder("index").param("id", 1).build().to_string();

    for key in [&key_one, &key_two, &other] {
        cache.get(key, loader.returning("v".to_string())).await.unwrap();
    }
    cache.flush().await.unwrap();

    let pattern = CacheKey::namespace_pattern("efforts").unwrap();
    assert_eq!(cache.invalidate_pattern(&pattern), 2);
    assert!(!cache.memory_contains(&key_one));
    assert!(cache.memory_contains(&other));

    // Disk rows are untouched, so the next read is a disk hit.
    let read = cache
        .get_with_meta(&key_one, loader.returning("new".to_string()))
        .await
        .unwrap();
    assert_tier(&read, Tier::Disk);
    assert_eq!(loader.calls(), 3);
}

#[tokio::test]
async fn test_pattern_matches_nothing() {
    let TestCache { cache, .. } = temp_coordinator::<String>(4096, Duration::from_secs(60));
    let loader = CountingLoader::new();
    cache.get("a", loader.returning("v".to_string())).await.unwrap();
    assert_eq!(cache.invalidate_pattern(&Regex::new("^zzz").unwrap()), 0);
    assert!(cache.memory_contains("a"));
}

// ============================================================================
// LOADER FAILURES AND REPEATED READS
// ============================================================================

#[tokio::test]
async fn test_failed_load_is_not_cached() {
    let TestCache { cache, .. } = temp_coordinator::<String>(1024, Duration::from_secs(60));
    let loader = CountingLoader::new();

    let err = cache
        .get("k", loader.failing::<String>("parse error"))
        .await
        .unwrap_err();
    assert_eq!(err, LoadError("parse error".to_string()));

    cache.flush().await.unwrap();
    assert!(!cache.memory_contains("k"));
    assert!(cache.disk().get("k").await.unwrap().is_none());

    let value = cache.get("k", loader.returning("ok".to_string())).await.unwrap();
    assert_eq!(value, "ok");
    assert_eq!(loader.calls(), 2);

    let stats = cache.stats().await;
    assert_eq!(stats.loads, 2);
    assert_eq!(stats.load_failures, 1);
}

#[tokio::test]
async fn test_repeated_gets_are_idempotent() {
    let TestCache { cache, .. } = temp_coordinator::<WorkEffort>(4096, Duration::from_secs(60));
    let loader = CountingLoader::new();
    let effort = WorkEffort::new("WE-0001", "Ship cache");

    let first = cache.get("we:1", loader.returning(effort.clone())).await.unwrap();
    let second = cache.get("we:1", loader.returning(effort.clone())).await.unwrap();
    let third = cache.get("we:1", loader.returning(effort.clone())).await.unwrap();

    assert_eq!(first, effort);
    assert_eq!(first, second);
    assert_eq!(second, third);
    assert_eq!(loader.calls(), 1);
}

// ============================================================================
// DEGRADATION
// ============================================================================

#[tokio::test]
async fn test_failing_disk_degrades_to_memory_only() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = CacheConfig::new()
        .with_disk_path(dir.path())
        .with_cleanup_interval(None);
    let disk = Arc::new(FailingDiskTier::new());
    let clock = Arc::new(ManualClock::new(START_MS));
    let cache: CacheCoordinator<String, FailingDiskTier> =
        CacheCoordinator::new(config, disk.clone(), clock);
    let loader = CountingLoader::new();

    let first = cache.get_with_meta("k", loader.returning("v".to_string())).await.unwrap();
    assert_tier(&first, Tier::Loader);
    let second = cache.get_with_meta("k", loader.returning("v".to_string())).await.unwrap();
    assert_tier(&second, Tier::Memory);
    assert_eq!(loader.calls(), 1);

    cache.flush().await.unwrap();
    assert!(disk.calls() >= 2);

    let stats = cache.stats().await;
    assert_eq!(stats.disk, Default::default());
    assert_eq!(stats.memory.entry_count, 1);

    // Invalidation still clears memory and reports the disk failure.
    assert!(cache.invalidate("k").await.is_err());
    assert!(!cache.memory_contains("k"));
}

// ============================================================================
// CONCURRENT MISSES
// ============================================================================

#[tokio::test]
async fn test_concurrent_misses_each_load_by_default() {
    let TestCache { cache, .. } = temp_coordinator::<String>(4096, Duration::from_secs(60));
    let cache = Arc::new(cache);
    let loader = CountingLoader::new();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let load = loader.slow("v".to_string(), Duration::from_millis(20));
        tasks.push(tokio::spawn(async move { cache.get("k", load).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "v");
    }

    assert_eq!(loader.calls(), 4);
}

#[tokio::test]
async fn test_dedupe_runs_one_loader() {
    let TestCache { cache, .. } = temp_coordinator_with::<String, _>(|config| config.with_dedupe(true));
    let cache = Arc::new(cache);
    let loader = CountingLoader::new();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let load = loader.slow("v".to_string(), Duration::from_millis(20));
        tasks.push(tokio::spawn(async move { cache.get("k", load).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "v");
    }

    assert_eq!(loader.calls(), 1);
}

#[tokio::test]
async fn test_dedupe_with_oversized_value_runs_one_loader() {
    let TestCache { cache, .. } =
        temp_coordinator_with::<String, _>(|config| config.with_max_size(10).with_dedupe(true));
    let cache = Arc::new(cache);
    let loader = CountingLoader::new();
    let big = "x".repeat(50);

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let cache = cache.clone();
        let load = loader.slow(big.clone(), Duration::from_millis(20));
        tasks.push(tokio::spawn(async move { cache.get("big", load).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), big);
    }

    // Followers found the leader's value on the disk path, queued or not.
    assert!(!cache.memory_contains("big"));
    assert_eq!(loader.calls(), 1);
}

// ============================================================================
// WRITES IN FLIGHT
// ============================================================================

#[tokio::test]
async fn test_loaded_value_served_while_disk_write_in_flight() {
    let (lmdb, clock, dir) = temp_disk_cache(Duration::from_secs(3600));
    let disk = Arc::new(GatedDiskTier::new(lmdb.clone()));
    // Too small for the value, so only the disk path can serve it again.
    let config = test_config(&dir, 10, Duration::from_secs(60));
    let cache: CacheCoordinator<String, GatedDiskTier<LmdbDiskCache>> =
        CacheCoordinator::new(config, disk.clone(), clock);
    let loader = CountingLoader::new();
    let big = "y".repeat(50);

    let first = cache.get_with_meta("big", loader.returning(big.clone())).await.unwrap();
    assert_tier(&first, Tier::Loader);
    assert!(lmdb.get("big").await.unwrap().is_none(), "write still held");

    let second = cache
        .get_with_meta("big", loader.returning("other".to_string()))
        .await
        .unwrap();
    assert_tier(&second, Tier::Disk);
    assert_eq!(second.etag(), first.etag());
    assert_eq!(second.into_value(), big);
    assert_eq!(loader.calls(), 1);

    disk.open();
    cache.flush().await.unwrap();
    assert!(lmdb.get("big").await.unwrap().is_some());
}

#[tokio::test]
async fn test_invalidate_drops_write_in_flight() {
    let (lmdb, clock, dir) = temp_disk_cache(Duration::from_secs(3600));
    let disk = Arc::new(GatedDiskTier::new(lmdb.clone()));
    let config = test_config(&dir, 10, Duration::from_secs(60));
    let cache: CacheCoordinator<String, GatedDiskTier<LmdbDiskCache>> =
        CacheCoordinator::new(config, disk.clone(), clock);
    let loader = CountingLoader::new();

    cache.get("big", loader.returning("z".repeat(50))).await.unwrap();

    let invalidate = cache.invalidate("big");
    disk.open();
    invalidate.await.unwrap();

    assert!(lmdb.get("big").await.unwrap().is_none());
    cache.get("big", loader.returning("z".repeat(50))).await.unwrap();
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_long_keys_reach_disk() {
    let TestCache { cache, .. } = temp_coordinator::<String>(300, Duration::from_secs(60));
    let loader = CountingLoader::new();
    let long_key = format!("efforts:{}", "x".repeat(480));

    cache.get(&long_key, loader.returning(value('l'))).await.unwrap();
    cache.flush().await.unwrap();
    let row = cache.disk().get(&long_key).await.unwrap().expect("long key stored");
    assert_eq!(row.key, long_key);

    // Pushed out of memory and served back from disk.
    for (key, fill) in [("A", 'a'), ("B", 'b'), ("C", 'c')] {
        cache.get(key, loader.returning(value(fill))).await.unwrap();
    }
    assert!(!cache.memory_contains(&long_key));
    let read = cache
        .get_with_meta(&long_key, loader.returning(value('z')))
        .await
        .unwrap();
    assert_tier(&read, Tier::Disk);
    assert_eq!(read.into_value(), value('l'));
    assert_eq!(loader.calls(), 4);
}

// ============================================================================
// ETAGS AND FRESHNESS KEYS
// ============================================================================

#[tokio::test]
async fn test_find_by_etag_after_load() {
    let TestCache { cache, .. } = temp_coordinator::<String>(4096, Duration::from_secs(60));
    let loader = CountingLoader::new();

    let read = cache
        .get_with_meta("efforts:active", loader.returning("payload".to_string()))
        .await
        .unwrap();
    let etag = read.etag().expect("loaded values carry an etag").to_string();
    cache.flush().await.unwrap();

    let keys = cache.disk().find_by_etag(&etag).await.unwrap();
    assert_eq!(keys, vec!["efforts:active".to_string()]);
}

#[tokio::test]
async fn test_freshness_signal_change_misses() {
    let TestCache { cache, .. } = temp_coordinator::<String>(4096, Duration::from_secs(60));
    let loader = CountingLoader::new();

    let key_at = |ms: u64| {
        CacheKey::builder("efforts")
            .param("status", "active")
            .freshness(FreshnessSignal::Mtime(ms))
            .build()
            .to_string()
    };

    cache.get(&key_at(1), loader.returning("old".to_string())).await.unwrap();
    cache.get(&key_at(1), loader.returning("old".to_string())).await.unwrap();
    let fresh = cache.get(&key_at(2), loader.returning("new".to_string())).await.unwrap();

    assert_eq!(fresh, "new");
    assert_eq!(loader.calls(), 2);
}

#[tokio::test]
async fn test_cleanup_through_coordinator() {
    let TestCache { cache, clock, .. } = temp_coordinator_with::<String, _>(|config| {
        config.with_disk_max_age(Duration::from_secs(10))
    });
    let loader = CountingLoader::new();

    cache.get("a", loader.returning("1".to_string())).await.unwrap();
    cache.get("b", loader.returning("2".to_string())).await.unwrap();
    cache.flush().await.unwrap();

    clock.advance_ms(10_001);
    assert_eq!(cache.cleanup().await.unwrap(), 2);

    let stats = cache.stats().await;
    assert_eq!(stats.disk.row_count, 0);
    assert_eq!(stats.disk.last_cleanup_ms, Some(clock.now_ms()));
}
