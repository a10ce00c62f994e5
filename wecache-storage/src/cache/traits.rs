//! Disk tier trait.
//!
//! The coordinator is generic over [`DiskTier`] so the persistent tier can be
//! swapped (LMDB in production, failing or in-memory doubles in tests).

use async_trait::async_trait;
use wecache_core::{CacheResult, DiskStats};

use super::row::StoredRow;

/// Persistent second tier.
///
/// Implementations enforce age-based expiry only. ETags are stored and
/// returned but never used to invalidate; comparing them against an external
/// source is the caller's job.
#[async_trait]
pub trait DiskTier: Send + Sync + 'static {
    /// Fetch a live row. A stale row is a miss and is removed lazily.
    async fn get(&self, key: &str) -> CacheResult<Option<StoredRow>>;

    /// Insert or replace the row for `row.key`.
    async fn put(&self, row: StoredRow) -> CacheResult<()>;

    /// Remove a row. Returns whether it existed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Remove every row older than the tier's max age. Returns the count.
    async fn cleanup(&self) -> CacheResult<u64>;

    /// Keys of live rows carrying `etag`.
    async fn find_by_etag(&self, etag: &str) -> CacheResult<Vec<String>>;

    /// Remove every row. Returns the count.
    async fn clear(&self) -> CacheResult<u64>;

    async fn stats(&self) -> CacheResult<DiskStats>;
}
