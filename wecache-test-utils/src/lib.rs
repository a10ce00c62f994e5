//! wecache Test Utilities
//!
//! Shared test infrastructure for the wecache workspace:
//! - Proptest generators for keys and cacheable values
//! - Fixtures for temp-dir backed disk tiers and coordinators
//! - Counting and failing loaders
//! - Disk tier doubles: one that fails every call, one that holds writes
//! - Assertions for tier provenance and budget accounting

// Re-export core types for convenience
pub use wecache_core::{
    CacheConfig, CacheError, CacheRead, CacheResult, Clock, DiskStats, EntryMetadata, ManualClock,
    MemoryStats, StorageError, Tier,
};
pub use wecache_storage::cache::{CacheCoordinator, DiskTier, LmdbDiskCache, StoredRow};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A representative cached value: one parsed work-effort record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkEffort {
    pub id: String,
    pub title: String,
    pub status: String,
    pub tags: Vec<String>,
    pub body: String,
}

impl WorkEffort {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: "active".to_string(),
            tags: Vec::new(),
            body: String::new(),
        }
    }
}

/// A JSON string whose canonical encoding is exactly `size` bytes.
///
/// `size` counts the two surrounding quotes, so it must be at least 2.
pub fn string_of_encoded_size(fill: char, size: usize) -> String {
    assert!(fill.is_ascii_alphanumeric(), "fill must encode as one byte");
    std::iter::repeat(fill).take(size.saturating_sub(2)).collect()
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache keys and values.

    use super::*;
    use proptest::prelude::*;

    /// A namespaced key such as `efforts:3f9a`.
    pub fn arb_key() -> impl Strategy<Value = String> {
        ("[a-z]{1,8}", "[0-9a-f]{1,8}").prop_map(|(ns, id)| format!("{}:{}", ns, id))
    }

    /// A key drawn from a small pool, so sequences revisit keys.
    pub fn arb_pooled_key(pool: u8) -> impl Strategy<Value = String> {
        (0..pool).prop_map(|i| format!("k{}", i))
    }

    pub fn arb_status() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("active".to_string()),
            Just("paused".to_string()),
            Just("done".to_string()),
        ]
    }

    pub fn arb_work_effort() -> impl Strategy<Value = WorkEffort> {
        (
            "WE-[0-9]{4}",
            "[A-Za-z ]{1,40}",
            arb_status(),
            prop::collection::vec("[a-z]{2,10}", 0..5),
            ".{0,200}",
        )
            .prop_map(|(id, title, status, tags, body)| WorkEffort {
                id,
                title,
                status,
                tags,
                body,
            })
    }

    /// A string value with an exact encoded size in `range`.
    pub fn arb_sized_value(range: std::ops::Range<usize>) -> impl Strategy<Value = String> {
        range.prop_map(|size| string_of_encoded_size('x', size.max(2)))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Temp-dir backed tiers on a manual clock.

    use super::*;
    use tempfile::TempDir;

    /// Starting time for fixture clocks, far enough from zero that
    /// subtracting a max age never saturates.
    pub const START_MS: u64 = 1_700_000_000_000;

    /// A coordinator with its clock and backing directory.
    ///
    /// The directory is removed when the fixture is dropped.
    pub struct TestCache<V: wecache_core::CacheValue> {
        pub cache: CacheCoordinator<V>,
        pub clock: Arc<ManualClock>,
        pub dir: TempDir,
    }

    /// Configuration pointing at `dir`, with the cleanup task disabled.
    pub fn test_config(dir: &TempDir, max_size: u64, memory_max_age: Duration) -> CacheConfig {
        CacheConfig::new()
            .with_max_size(max_size)
            .with_memory_max_age(memory_max_age)
            .with_disk_path(dir.path())
            .with_map_size_mb(16)
            .with_cleanup_interval(None)
    }

    /// An LMDB disk tier in a fresh temp dir.
    pub fn temp_disk_cache(max_age: Duration) -> (Arc<LmdbDiskCache>, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = Arc::new(ManualClock::new(START_MS));
        let disk =
            LmdbDiskCache::open_path(dir.path(), 16, max_age.as_millis() as u64, clock.clone())
                .expect("disk cache creation should succeed");
        (Arc::new(disk), clock, dir)
    }

    /// A coordinator over a fresh LMDB tier. Call from inside a tokio runtime.
    pub fn temp_coordinator<V: wecache_core::CacheValue>(
        max_size: u64,
        memory_max_age: Duration,
    ) -> TestCache<V> {
        temp_coordinator_with(|config| {
            config
                .with_max_size(max_size)
                .with_memory_max_age(memory_max_age)
        })
    }

    /// A coordinator whose configuration is adjusted by `customize`.
    pub fn temp_coordinator_with<V, F>(customize: F) -> TestCache<V>
    where
        V: wecache_core::CacheValue,
        F: FnOnce(CacheConfig) -> CacheConfig,
    {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let config = customize(test_config(&dir, 1024 * 1024, Duration::from_secs(300)));
        let clock = Arc::new(ManualClock::new(START_MS));
        let disk = LmdbDiskCache::open(&config.disk, clock.clone())
            .expect("disk cache creation should succeed");
        let cache = CacheCoordinator::new(config, Arc::new(disk), clock.clone());
        TestCache { cache, clock, dir }
    }
}

// ============================================================================
// LOADERS
// ============================================================================

pub mod loaders {
    //! Loaders that record how often they ran.

    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Future returned by the loaders below.
    pub type LoadFuture<V> = Pin<Box<dyn Future<Output = Result<V, LoadError>> + Send>>;

    /// Error returned by failing loaders.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("load failed: {0}")]
    pub struct LoadError(pub String);

    /// Counts invocations across clones.
    #[derive(Debug, Clone, Default)]
    pub struct CountingLoader {
        calls: Arc<AtomicUsize>,
    }

    impl CountingLoader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// A loader that succeeds with `value`.
        pub fn returning<V: Send + 'static>(
            &self,
            value: V,
        ) -> impl FnOnce() -> LoadFuture<V> {
            let calls = self.calls.clone();
            move || -> LoadFuture<V> {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(value)
                })
            }
        }

        /// A loader that fails with `message`.
        pub fn failing<V: Send + 'static>(
            &self,
            message: &str,
        ) -> impl FnOnce() -> LoadFuture<V> {
            let calls = self.calls.clone();
            let message = message.to_string();
            move || -> LoadFuture<V> {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(LoadError(message))
                })
            }
        }

        /// A loader that sleeps for `delay` before succeeding with `value`.
        pub fn slow<V: Send + 'static>(
            &self,
            value: V,
            delay: Duration,
        ) -> impl FnOnce() -> LoadFuture<V> {
            let calls = self.calls.clone();
            move || -> LoadFuture<V> {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    Ok(value)
                })
            }
        }
    }
}

// ============================================================================
// MOCK DISK TIER
// ============================================================================

pub mod mocks {
    //! Disk tier doubles.

    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::watch;

    /// A disk tier whose every operation fails with an I/O error.
    #[derive(Debug, Default)]
    pub struct FailingDiskTier {
        calls: AtomicU64,
    }

    impl FailingDiskTier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Operations attempted so far.
        pub fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }

        fn fail<T>(&self, op: &str) -> CacheResult<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::Io {
                reason: format!("{} failed: disk unavailable", op),
            }
            .into())
        }
    }

    #[async_trait]
    impl DiskTier for FailingDiskTier {
        async fn get(&self, _key: &str) -> CacheResult<Option<StoredRow>> {
            self.fail("get")
        }

        async fn put(&self, _row: StoredRow) -> CacheResult<()> {
            self.fail("put")
        }

        async fn delete(&self, _key: &str) -> CacheResult<bool> {
            self.fail("delete")
        }

        async fn cleanup(&self) -> CacheResult<u64> {
            self.fail("cleanup")
        }

        async fn find_by_etag(&self, _etag: &str) -> CacheResult<Vec<String>> {
            self.fail("find_by_etag")
        }

        async fn clear(&self) -> CacheResult<u64> {
            self.fail("clear")
        }

        async fn stats(&self) -> CacheResult<DiskStats> {
            self.fail("stats")
        }
    }

    /// Wraps a disk tier and holds every `put` until [`open`](Self::open)
    /// is called, so tests can observe a write that is still in flight.
    /// Other operations pass straight through.
    pub struct GatedDiskTier<D> {
        inner: Arc<D>,
        gate: watch::Sender<bool>,
    }

    impl<D: DiskTier> GatedDiskTier<D> {
        pub fn new(inner: Arc<D>) -> Self {
            let (gate, _) = watch::channel(false);
            Self { inner, gate }
        }

        /// Release held puts and let later ones through.
        pub fn open(&self) {
            self.gate.send_replace(true);
        }

        pub fn inner(&self) -> &Arc<D> {
            &self.inner
        }
    }

    #[async_trait]
    impl<D: DiskTier> DiskTier for GatedDiskTier<D> {
        async fn get(&self, key: &str) -> CacheResult<Option<StoredRow>> {
            self.inner.get(key).await
        }

        async fn put(&self, row: StoredRow) -> CacheResult<()> {
            let mut open = self.gate.subscribe();
            // The sender lives in `self`, so this only returns once opened.
            let _ = open.wait_for(|open| *open).await;
            self.inner.put(row).await
        }

        async fn delete(&self, key: &str) -> CacheResult<bool> {
            self.inner.delete(key).await
        }

        async fn cleanup(&self) -> CacheResult<u64> {
            self.inner.cleanup().await
        }

        async fn find_by_etag(&self, etag: &str) -> CacheResult<Vec<String>> {
            self.inner.find_by_etag(etag).await
        }

        async fn clear(&self) -> CacheResult<u64> {
            self.inner.clear().await
        }

        async fn stats(&self) -> CacheResult<DiskStats> {
            self.inner.stats().await
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Cache-specific assertions.

    use super::*;

    /// Assert that a read was served by `expected`.
    pub fn assert_tier<T: std::fmt::Debug>(read: &CacheRead<T>, expected: Tier) {
        assert_eq!(
            read.tier(),
            expected,
            "expected read from {} tier, got {:?}",
            expected,
            read
        );
    }

    /// Assert the memory tier is within its byte budget.
    pub fn assert_within_budget(stats: &MemoryStats) {
        assert!(
            stats.current_size <= stats.max_size,
            "memory tier over budget: {} > {}",
            stats.current_size,
            stats.max_size
        );
    }

    /// Assert that a result is a storage error.
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(
            matches!(result, Err(CacheError::Storage(_))),
            "Expected storage error, got {:?}",
            result
        );
    }
}
