//! Two-tier cache: memory LRU in front of an LMDB disk store.
//!
//! # Tiers
//!
//! - [`MemoryCache`]: byte-budgeted, age-bounded LRU over an index-addressed
//!   arena. Evictions are reported to a listener.
//! - [`LmdbDiskCache`]: persistent rows with their own max age, a content
//!   ETag per row, and secondary indexes on write time and ETag.
//! - [`CacheCoordinator`]: memory, then disk (with promotion), then the
//!   caller's loader. Memory evictions are written back to disk.
//!
//! # Freshness
//!
//! Both tiers expire by age only. Whether a cached value still matches its
//! source files is the caller's question: fold a
//! [`FreshnessSignal`](wecache_core::FreshnessSignal) into the key, or
//! compare the ETag on the returned [`CacheRead`](wecache_core::CacheRead).
//!
//! # Example
//!
//! ```ignore
//! let cache: CacheCoordinator<Vec<WorkEffort>> = CacheCoordinator::open(config)?;
//!
//! let key = CacheKey::builder("efforts")
//!     .param("status", "active")
//!     .freshness(FreshnessSignal::of_path(&efforts_dir)?)
//!     .build();
//!
//! let efforts = cache.get(&key.to_string(), || repo.load_active()).await?;
//! ```

pub mod cleanup;
pub mod coordinator;
pub mod disk;
pub mod memory;
pub mod row;
pub mod single_flight;
pub mod traits;
pub mod write_behind;

pub use cleanup::{cleanup_task, spawn_cleanup_task, CleanupMetrics, CleanupSnapshot};
pub use coordinator::CacheCoordinator;
pub use disk::{LmdbCacheError, LmdbDiskCache};
pub use memory::{EvictionListener, MemoryCache, SetOutcome};
pub use row::{StoredRow, MAX_ETAG_LEN};
pub use single_flight::{KeyGuard, KeyedLocks};
pub use traits::DiskTier;
pub use write_behind::{PutReceipt, WriteBehind};
