//! wecache storage - the memory tier, the LMDB disk tier and the coordinator
//! that joins them.
//!
//! Shared types (configuration, errors, entries, keys, statistics) live in
//! `wecache-core` and are re-exported here for convenience.

pub mod cache;

pub use cache::{
    CacheCoordinator, CleanupMetrics, DiskTier, LmdbCacheError, LmdbDiskCache, MemoryCache,
    SetOutcome, StoredRow,
};

pub use wecache_core::{
    CacheConfig, CacheError, CacheKey, CacheRead, CacheResult, CacheValue, Clock,
    CoordinatorStats, DiskStats, EntryMetadata, FreshnessSignal, ManualClock, MemoryStats,
    SystemClock, Tier,
};
