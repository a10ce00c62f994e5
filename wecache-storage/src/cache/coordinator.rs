//! Two-tier cache coordinator.
//!
//! Reads go memory, then disk (promoting hits into memory), then the
//! caller's loader, whose result populates both tiers. Entries the memory
//! tier evicts under pressure are written back to disk, so the two tiers act
//! as one cache with a capacity cliff.
//!
//! # Concurrency
//!
//! The memory tier sits behind a `std::sync::Mutex` that is never held across
//! an await. Disk writes go through the ordered [`WriteBehind`] queue, and
//! the disk read path consults its not-yet-applied rows before LMDB, so a
//! loaded or demoted value is never in neither tier. A call that evicts
//! entries waits for their write-back before returning; its own miss
//! population is not waited for. Two
//! concurrent misses on one key both run their loaders unless
//! `dedupe_concurrent_loads` is set, in which case they serialise on a
//! per-key lock and the follower usually finds the leader's value.
//!
//! # Error handling
//!
//! Disk failures never fail a read: they are logged and treated as misses.
//! Loader errors propagate unchanged and nothing is cached for them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use wecache_core::{
    CacheConfig, CacheEntry, CacheRead, CacheResult, CacheValue, Clock, CoordinatorStats,
    EntryMetadata, MemoryStats, SystemClock, Tier,
};

use super::cleanup::spawn_cleanup_task;
use super::disk::LmdbDiskCache;
use super::memory::{MemoryCache, SetOutcome};
use super::row::StoredRow;
use super::single_flight::KeyedLocks;
use super::traits::DiskTier;
use super::write_behind::{PutReceipt, WriteBehind};

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    load_failures: AtomicU64,
    promotions: AtomicU64,
    write_backs: AtomicU64,
}

/// Single entry point for cache-aware reads and cross-tier invalidation.
///
/// # Example
///
/// ```ignore
/// use wecache_core::CacheConfig;
/// use wecache_storage::cache::CacheCoordinator;
///
/// let cache: CacheCoordinator<Vec<String>> = CacheCoordinator::open(CacheConfig::from_env())?;
///
/// let ids = cache
///     .get("efforts:active", || async { repository.active_ids().await })
///     .await?;
/// ```
pub struct CacheCoordinator<V: CacheValue, D: DiskTier = LmdbDiskCache> {
    memory: Mutex<MemoryCache<V>>,
    disk: Arc<D>,
    writer: WriteBehind,
    flights: Option<KeyedLocks>,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    /// Write-back receipts queued by the eviction listener, drained by the
    /// caller that caused the eviction.
    demoted: Arc<Mutex<Vec<PutReceipt>>>,
    config: CacheConfig,
    cleanup_shutdown: Option<watch::Sender<bool>>,
}

impl<V: CacheValue> CacheCoordinator<V, LmdbDiskCache> {
    /// Validate `config` and open the LMDB disk tier it names.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let disk = LmdbDiskCache::open(&config.disk, clock.clone())?;
        Ok(Self::new(config, Arc::new(disk), clock))
    }
}

impl<V: CacheValue, D: DiskTier> CacheCoordinator<V, D> {
    /// Build a coordinator over an existing disk tier.
    ///
    /// Spawns the write-behind worker and, when configured, the periodic
    /// cleanup task, so it must be called from within a tokio runtime.
    pub fn new(config: CacheConfig, disk: Arc<D>, clock: Arc<dyn Clock>) -> Self {
        let (writer, _worker) = WriteBehind::spawn(disk.clone());
        let counters = Arc::new(Counters::default());
        let demoted = Arc::new(Mutex::new(Vec::new()));

        let mut memory = MemoryCache::new(&config.memory, clock.clone());
        memory.set_eviction_listener(write_back_listener(
            writer.clone(),
            counters.clone(),
            demoted.clone(),
            clock.clone(),
        ));

        let cleanup_shutdown = config.disk.cleanup_interval.map(|period| {
            let (tx, rx) = watch::channel(false);
            // The task ends on its own once `tx` is dropped with us.
            let _task = spawn_cleanup_task(disk.clone(), period, rx);
            tx
        });

        let flights = config.dedupe_concurrent_loads.then(KeyedLocks::new);

        tracing::debug!(
            max_size = config.memory.max_size_bytes,
            memory_max_age_ms = duration_ms(config.memory.max_age),
            disk_max_age_ms = duration_ms(config.disk.max_age),
            dedupe = config.dedupe_concurrent_loads,
            "cache coordinator ready"
        );

        Self {
            memory: Mutex::new(memory),
            disk,
            writer,
            flights,
            clock,
            counters,
            demoted,
            config,
            cleanup_shutdown,
        }
    }

    /// Return the cached value for `key`, running `loader` on a full miss.
    ///
    /// `loader` runs at most once per call. Its error is returned as-is and
    /// leaves both tiers untouched.
    pub async fn get<F, Fut, E>(&self, key: &str, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.get_with_meta(key, loader)
            .await
            .map(CacheRead::into_value)
    }

    /// Like [`get`](Self::get), also reporting which tier served the value,
    /// its ETag and when it was cached.
    pub async fn get_with_meta<F, Fut, E>(&self, key: &str, loader: F) -> Result<CacheRead<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(read) = self.read_memory(key) {
            return Ok(read);
        }

        let _flight = match &self.flights {
            Some(flights) => {
                let guard = flights.lock(key).await;
                // Another caller may have loaded while we waited.
                if let Some(read) = self.read_memory(key) {
                    return Ok(read);
                }
                Some(guard)
            }
            None => None,
        };

        if let Some(read) = self.read_disk(key).await {
            return Ok(read);
        }

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        match loader().await {
            Ok(value) => Ok(self.populate(key, value).await),
            Err(e) => {
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key, "loader failed; nothing cached");
                Err(e)
            }
        }
    }

    /// Remove `key` from both tiers. Returns whether either tier held it.
    ///
    /// The disk delete is ordered after every queued write, so once this
    /// returns the next `get` for `key` misses both tiers.
    pub async fn invalidate(&self, key: &str) -> CacheResult<bool> {
        let in_memory = self.lock_memory().delete(key);
        let on_disk = self.writer.delete(key).await?;
        // A concurrent read may have promoted the old row while the delete
        // was queued.
        let promoted = self.lock_memory().delete(key);

        tracing::debug!(key, in_memory, on_disk, "invalidated");
        Ok(in_memory || on_disk || promoted)
    }

    /// Remove every memory tier key matching `pattern`. Returns the count.
    ///
    /// Disk rows are not scanned; matching rows stay readable until they
    /// age out or are invalidated by key.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let removed = self.lock_memory().remove_matching(pattern);
        tracing::debug!(pattern = pattern.as_str(), removed, "invalidated memory keys by pattern");
        removed
    }

    /// Empty both tiers. Returns the number of disk rows removed.
    pub async fn invalidate_all(&self) -> CacheResult<u64> {
        self.lock_memory().clear();
        let removed = self.writer.clear().await?;
        self.lock_memory().clear();
        Ok(removed)
    }

    /// Drop stale memory entries and run a disk cleanup pass. Returns the
    /// number of disk rows removed.
    pub async fn cleanup(&self) -> CacheResult<u64> {
        let expired = self.lock_memory().evict_expired();
        let removed = self.disk.cleanup().await?;
        tracing::debug!(expired, removed, "cleanup pass finished");
        Ok(removed)
    }

    /// Wait until every queued disk write has been applied.
    pub async fn flush(&self) -> CacheResult<()> {
        self.writer.flush().await
    }

    /// Combined statistics. A failing disk tier reports default disk stats.
    pub async fn stats(&self) -> CoordinatorStats {
        let memory = self.memory_stats();
        let disk = match self.disk.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "disk tier stats unavailable");
                Default::default()
            }
        };

        CoordinatorStats {
            memory,
            disk,
            loads: self.counters.loads.load(Ordering::Relaxed),
            load_failures: self.counters.load_failures.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            write_backs: self.counters.write_backs.load(Ordering::Relaxed),
        }
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.lock_memory().stats()
    }

    /// Whether the memory tier holds a live entry for `key`. Does not touch
    /// recency or statistics.
    pub fn memory_contains(&self, key: &str) -> bool {
        self.lock_memory().contains(key)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn disk(&self) -> &Arc<D> {
        &self.disk
    }

    // ------------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------------

    fn read_memory(&self, key: &str) -> Option<CacheRead<V>> {
        let mut memory = self.lock_memory();
        let entry = memory.get_entry(key)?;
        tracing::trace!(key, tier = %Tier::Memory, "cache hit");
        Some(CacheRead::new(
            entry.value.clone(),
            Tier::Memory,
            entry.etag.clone(),
            entry.timestamp_ms,
        ))
    }

    async fn read_disk(&self, key: &str) -> Option<CacheRead<V>> {
        let row = match self.queued_row(key) {
            Some(row) => row,
            None => match self.disk.get(key).await {
                Ok(Some(row)) => row,
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(key, error = %e, "disk tier read failed; treating as miss");
                    return None;
                }
            },
        };

        let value: V = match row.decode_value() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, error = %e, "disk row undecodable; treating as miss");
                return None;
            }
        };

        let (outcome, write_backs) =
            self.insert_memory(key, value.clone(), row.size_bytes, Some(row.etag.clone()));
        if outcome.is_stored() {
            self.counters.promotions.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(key, tier = %Tier::Disk, bytes = row.size_bytes, "cache hit; promoted");
        settle(write_backs).await;

        Some(CacheRead::new(
            value,
            Tier::Disk,
            Some(row.etag),
            row.timestamp_ms,
        ))
    }

    /// A queued disk write for `key` the worker has not applied yet, if
    /// still within the disk max age.
    fn queued_row(&self, key: &str) -> Option<StoredRow> {
        let row = self.writer.pending(key)?;
        let max_age_ms = duration_ms(self.config.disk.max_age);
        (!row.is_expired(self.clock.now_ms(), max_age_ms)).then_some(row)
    }

    /// Insert into the memory tier, returning the receipts of any
    /// write-backs the insert caused.
    fn insert_memory(
        &self,
        key: &str,
        value: V,
        size_bytes: u64,
        etag: Option<String>,
    ) -> (SetOutcome, Vec<PutReceipt>) {
        let mut memory = self.lock_memory();
        let outcome = memory.insert_sized(key, value, size_bytes, etag);
        // Drained under the memory lock, so only this insert's evictions.
        let receipts = std::mem::take(
            &mut *self.demoted.lock().unwrap_or_else(PoisonError::into_inner),
        );
        drop(memory);
        (outcome, receipts)
    }

    /// Cache a freshly loaded value in both tiers and wrap it for the caller.
    async fn populate(&self, key: &str, value: V) -> CacheRead<V> {
        let now = self.clock.now_ms();
        let row = match StoredRow::from_value(key, &value, EntryMetadata::new(), now) {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(key, error = %e, "loaded value not cacheable");
                return CacheRead::new(value, Tier::Loader, None, now);
            }
        };

        let (outcome, write_backs) =
            self.insert_memory(key, value.clone(), row.size_bytes, Some(row.etag.clone()));
        if let SetOutcome::Oversized { size_bytes } = outcome {
            tracing::debug!(key, bytes = size_bytes, "value exceeds memory budget; disk only");
        }

        let read = CacheRead::new(value, Tier::Loader, Some(row.etag.clone()), now);
        // Queued after the write-backs above; readers see it via `queued_row`.
        if let Err(e) = self.writer.enqueue_put(row) {
            tracing::warn!(key, error = %e, "disk write not queued");
        }
        settle(write_backs).await;
        read
    }

    fn lock_memory(&self) -> MutexGuard<'_, MemoryCache<V>> {
        // Every mutation completes before the lock is released, so a
        // poisoned guard still holds a consistent list.
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: CacheValue, D: DiskTier> Drop for CacheCoordinator<V, D> {
    fn drop(&mut self) {
        if let Some(shutdown) = self.cleanup_shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

/// Demote evicted memory entries to the disk tier.
///
/// Runs under the memory lock, so the put is queued before any later
/// invalidation of the same key.
fn write_back_listener<V: CacheValue>(
    writer: WriteBehind,
    counters: Arc<Counters>,
    demoted: Arc<Mutex<Vec<PutReceipt>>>,
    clock: Arc<dyn Clock>,
) -> Box<dyn FnMut(&CacheEntry<V>) + Send> {
    Box::new(move |entry| match StoredRow::from_entry(entry, clock.now_ms()) {
        Ok(row) => match writer.enqueue_put(row) {
            Ok(receipt) => {
                counters.write_backs.fetch_add(1, Ordering::Relaxed);
                demoted
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(receipt);
            }
            Err(e) => tracing::warn!(key = %entry.key, error = %e, "write-back not queued"),
        },
        Err(e) => tracing::warn!(key = %entry.key, error = %e, "write-back skipped"),
    })
}

/// Wait until each write-back has been applied to the disk tier.
async fn settle(receipts: Vec<PutReceipt>) {
    for receipt in receipts {
        receipt.await;
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
