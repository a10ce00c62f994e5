//! LMDB-backed disk tier.
//!
//! Uses the heed crate (Rust bindings for LMDB). One environment holds three
//! named databases:
//!
//! - `entries`: `sha256(key)` -> encoded [`StoredRow`] (which carries the key)
//! - `by_timestamp`: `timestamp_ms (BE) ++ sha256(key)` -> (), ordered oldest
//!   first so `cleanup` walks only the rows it removes
//! - `by_etag`: `sha256(etag) ++ sha256(key)` -> (), for content lookups
//!
//! Every LMDB key is fixed-length, so cache keys and ETags of any length stay
//! under LMDB's key size limit. Both indexes are updated in the same write
//! transaction as the row.
//!
//! # Thread Safety
//!
//! LMDB serialises writers and gives readers a consistent snapshot. Counters
//! are atomics; the last cleanup record sits behind an `RwLock`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use heed::types::{Bytes, Unit};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::Serialize;
use wecache_core::{
    compute_content_hash, CacheError, CacheResult, Clock, ContentHash, DiskStats, DiskTierConfig,
    EntryMetadata, StorageError,
};

use super::row::StoredRow;
use super::traits::DiskTier;

/// Error type for LMDB disk tier operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment at {path}: {reason}")]
    EnvOpen { path: String, reason: String },

    /// Failed to open a named database within the environment.
    #[error("Failed to open database {name}: {reason}")]
    DbOpen { name: &'static str, reason: String },

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A row could not be encoded or parsed.
    #[error(transparent)]
    Row(#[from] StorageError),

    /// Encoding a value for storage failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::EnvOpen { path, reason } => {
                CacheError::Storage(StorageError::EnvOpen { path, reason })
            }
            LmdbCacheError::Row(inner) => CacheError::Storage(inner),
            LmdbCacheError::Io(io) => CacheError::Storage(StorageError::Io {
                reason: io.to_string(),
            }),
            other => CacheError::Storage(StorageError::TransactionFailed {
                reason: other.to_string(),
            }),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

const ENTRIES_DB: &str = "entries";
const BY_TIMESTAMP_DB: &str = "by_timestamp";
const BY_ETAG_DB: &str = "by_etag";
const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy)]
struct CleanupRecord {
    at_ms: u64,
    removed: u64,
}

/// LMDB-backed persistent cache tier.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use wecache_core::{DiskTierConfig, EntryMetadata, SystemClock};
/// use wecache_storage::cache::{DiskTier, LmdbDiskCache};
///
/// let disk = LmdbDiskCache::open(&DiskTierConfig::default(), Arc::new(SystemClock))?;
/// disk.set("efforts:active", &vec!["WE-0001"], EntryMetadata::new())?;
/// let row = disk.get("efforts:active").await?;
/// ```
pub struct LmdbDiskCache {
    env: Env,
    entries: Database<Bytes, Bytes>,
    by_timestamp: Database<Bytes, Unit>,
    by_etag: Database<Bytes, Unit>,
    path: PathBuf,
    max_age_ms: u64,
    clock: Arc<dyn Clock>,
    size_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    last_cleanup: RwLock<Option<CleanupRecord>>,
}

impl LmdbDiskCache {
    /// Open (or create) the environment described by `config`.
    pub fn open(config: &DiskTierConfig, clock: Arc<dyn Clock>) -> Result<Self, LmdbCacheError> {
        Self::open_path(
            &config.path,
            config.map_size_mb,
            config.max_age.as_millis() as u64,
            clock,
        )
    }

    /// Open (or create) an environment at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - A named database cannot be created
    pub fn open_path<P: AsRef<Path>>(
        path: P,
        map_size_mb: usize,
        max_age_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LmdbCacheError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(3)
                .open(path)
        }
        .map_err(|e| LmdbCacheError::EnvOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let entries: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(ENTRIES_DB))
            .map_err(|e| LmdbCacheError::DbOpen {
                name: ENTRIES_DB,
                reason: e.to_string(),
            })?;
        let by_timestamp: Database<Bytes, Unit> = env
            .create_database(&mut wtxn, Some(BY_TIMESTAMP_DB))
            .map_err(|e| LmdbCacheError::DbOpen {
                name: BY_TIMESTAMP_DB,
                reason: e.to_string(),
            })?;
        let by_etag: Database<Bytes, Unit> = env
            .create_database(&mut wtxn, Some(BY_ETAG_DB))
            .map_err(|e| LmdbCacheError::DbOpen {
                name: BY_ETAG_DB,
                reason: e.to_string(),
            })?;
        wtxn.commit().map_err(txn_err)?;

        let cache = Self {
            env,
            entries,
            by_timestamp,
            by_etag,
            path: path.to_path_buf(),
            max_age_ms,
            clock,
            size_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_cleanup: RwLock::new(None),
        };

        let existing = cache.scan_size_bytes()?;
        cache.size_bytes.store(existing, Ordering::Relaxed);
        tracing::debug!(path = %path.display(), bytes = existing, "disk tier opened");

        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_age_ms(&self) -> u64 {
        self.max_age_ms
    }

    /// Serialize `value` and upsert it. The ETag is computed when absent.
    pub fn set<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        metadata: EntryMetadata,
    ) -> Result<StoredRow, LmdbCacheError> {
        let row = StoredRow::from_value(key, value, metadata, self.clock.now_ms())
            .map_err(|e| LmdbCacheError::Serialization(e.to_string()))?;
        self.put_row(&row)?;
        Ok(row)
    }

    // ------------------------------------------------------------------------
    // Synchronous LMDB operations
    // ------------------------------------------------------------------------

    fn read_row(&self, rtxn: &RoTxn<'_>, key: &str) -> Result<Option<StoredRow>, LmdbCacheError> {
        match self.entries.get(rtxn, &key_digest(key)).map_err(txn_err)? {
            Some(bytes) => {
                let row = StoredRow::from_bytes(key, bytes)?;
                // A digest shared with another key is somebody else's row.
                Ok((row.key == key).then_some(row))
            }
            None => Ok(None),
        }
    }

    fn read_digest(
        &self,
        rtxn: &RoTxn<'_>,
        digest: &[u8],
    ) -> Result<Option<Result<StoredRow, StorageError>>, LmdbCacheError> {
        Ok(self
            .entries
            .get(rtxn, digest)
            .map_err(txn_err)?
            .map(|bytes| StoredRow::from_bytes(&digest_label(digest), bytes)))
    }

    fn get_row(&self, key: &str) -> Result<Option<StoredRow>, LmdbCacheError> {
        let now = self.clock.now_ms();
        let row = {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            self.read_row(&rtxn, key)?
        };

        match row {
            Some(row) if !row.is_expired(now, self.max_age_ms) => Ok(Some(row)),
            Some(_) => {
                self.remove_if_stale(key, now)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Lazy expiry. Re-checked under the write lock so a fresher row written
    /// since the read is left alone.
    fn remove_if_stale(&self, key: &str, now: u64) -> Result<(), LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let stale = match self.read_row(&wtxn, key)? {
            Some(row) => row.is_expired(now, self.max_age_ms),
            None => false,
        };
        if stale {
            if let Some(removed) = self.remove_in(&mut wtxn, key)? {
                wtxn.commit().map_err(txn_err)?;
                self.size_bytes
                    .fetch_sub(removed.size_bytes.min(self.current_size()), Ordering::Relaxed);
                tracing::debug!(key, "disk tier dropped stale row");
            }
        }
        Ok(())
    }

    fn put_row(&self, row: &StoredRow) -> Result<(), LmdbCacheError> {
        // Encoded before the transaction so a rejected row changes nothing.
        let bytes = row.to_bytes()?;
        let digest = key_digest(&row.key);

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let replaced = self.remove_in(&mut wtxn, &row.key)?;

        self.entries
            .put(&mut wtxn, &digest, &bytes)
            .map_err(txn_err)?;
        self.by_timestamp
            .put(&mut wtxn, &timestamp_index_key(row.timestamp_ms, &digest), &())
            .map_err(txn_err)?;
        self.by_etag
            .put(&mut wtxn, &etag_index_key(&row.etag, &digest), &())
            .map_err(txn_err)?;

        wtxn.commit().map_err(txn_err)?;

        if let Some(old) = replaced {
            self.size_bytes
                .fetch_sub(old.size_bytes.min(self.current_size()), Ordering::Relaxed);
        }
        self.size_bytes.fetch_add(row.size_bytes, Ordering::Relaxed);
        Ok(())
    }

    fn delete_row(&self, key: &str) -> Result<bool, LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let removed = self.remove_in(&mut wtxn, key)?;
        wtxn.commit().map_err(txn_err)?;

        match removed {
            Some(row) => {
                self.size_bytes
                    .fetch_sub(row.size_bytes.min(self.current_size()), Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a row and its index entries inside `wtxn`.
    ///
    /// A corrupt row is still removed; its index entries are left for
    /// `cleanup` to clear.
    fn remove_in(
        &self,
        wtxn: &mut RwTxn<'_>,
        key: &str,
    ) -> Result<Option<StoredRow>, LmdbCacheError> {
        let digest = key_digest(key);
        let existing = match self.entries.get(wtxn, &digest).map_err(txn_err)? {
            Some(bytes) => StoredRow::from_bytes(key, bytes),
            None => return Ok(None),
        };

        match existing {
            Ok(row) if row.key != key => Ok(None),
            Ok(row) => {
                self.entries.delete(wtxn, &digest).map_err(txn_err)?;
                self.by_timestamp
                    .delete(wtxn, &timestamp_index_key(row.timestamp_ms, &digest))
                    .map_err(txn_err)?;
                self.by_etag
                    .delete(wtxn, &etag_index_key(&row.etag, &digest))
                    .map_err(txn_err)?;
                Ok(Some(row))
            }
            Err(e) => {
                self.entries.delete(wtxn, &digest).map_err(txn_err)?;
                tracing::warn!(key, error = %e, "removed corrupt disk row");
                Ok(None)
            }
        }
    }

    fn cleanup_rows(&self) -> Result<u64, LmdbCacheError> {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.max_age_ms);

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let mut doomed: Vec<(Vec<u8>, ContentHash, u64)> = Vec::new();
        for item in self.by_timestamp.iter(&wtxn).map_err(txn_err)? {
            let (index_key, ()) = item.map_err(txn_err)?;
            let Some((ts, digest)) = split_timestamp_index_key(index_key) else {
                continue;
            };
            if ts >= cutoff {
                break;
            }
            doomed.push((index_key.to_vec(), digest, ts));
        }

        let mut removed = 0u64;
        let mut freed = 0u64;
        for (index_key, digest, ts) in doomed {
            match self.read_digest(&wtxn, &digest)? {
                Some(Ok(row)) if row.timestamp_ms == ts => {
                    if let Some(row) = self.remove_in(&mut wtxn, &row.key)? {
                        removed += 1;
                        freed += row.size_bytes;
                    }
                }
                Some(Err(e)) => {
                    // Unparseable, so its size is unknown; the index entry
                    // that led here goes with it.
                    self.entries.delete(&mut wtxn, &digest).map_err(txn_err)?;
                    self.by_timestamp
                        .delete(&mut wtxn, &index_key)
                        .map_err(txn_err)?;
                    removed += 1;
                    tracing::warn!(row = %digest_label(&digest), error = %e, "cleanup removed corrupt disk row");
                }
                _ => {
                    // Orphaned index entry.
                    self.by_timestamp
                        .delete(&mut wtxn, &index_key)
                        .map_err(txn_err)?;
                }
            }
        }

        wtxn.commit().map_err(txn_err)?;

        self.size_bytes
            .fetch_sub(freed.min(self.current_size()), Ordering::Relaxed);
        if let Ok(mut last) = self.last_cleanup.write() {
            *last = Some(CleanupRecord {
                at_ms: now,
                removed,
            });
        }

        Ok(removed)
    }

    fn keys_for_etag(&self, etag: &str) -> Result<Vec<String>, LmdbCacheError> {
        let now = self.clock.now_ms();
        let rtxn = self.env.read_txn().map_err(txn_err)?;

        let prefix = compute_content_hash(etag.as_bytes());

        let mut candidates = Vec::new();
        for item in self.by_etag.prefix_iter(&rtxn, &prefix).map_err(txn_err)? {
            let (index_key, ()) = item.map_err(txn_err)?;
            candidates.push(index_key[prefix.len()..].to_vec());
        }

        let mut keys = Vec::with_capacity(candidates.len());
        for digest in candidates {
            if let Some(Ok(row)) = self.read_digest(&rtxn, &digest)? {
                if row.etag == etag && !row.is_expired(now, self.max_age_ms) {
                    keys.push(row.key);
                }
            }
        }
        Ok(keys)
    }

    fn clear_rows(&self) -> Result<u64, LmdbCacheError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let count = self.entries.len(&wtxn).map_err(txn_err)?;
        self.entries.clear(&mut wtxn).map_err(txn_err)?;
        self.by_timestamp.clear(&mut wtxn).map_err(txn_err)?;
        self.by_etag.clear(&mut wtxn).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        self.size_bytes.store(0, Ordering::Relaxed);
        Ok(count)
    }

    fn row_count(&self) -> Result<u64, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        self.entries.len(&rtxn).map_err(txn_err)
    }

    fn scan_size_bytes(&self) -> Result<u64, LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut total = 0u64;
        for item in self.entries.iter(&rtxn).map_err(txn_err)? {
            let (digest, bytes) = item.map_err(txn_err)?;
            match StoredRow::from_bytes(&digest_label(digest), bytes) {
                Ok(row) => total += row.size_bytes,
                Err(e) => tracing::warn!(error = %e, "skipping corrupt disk row"),
            }
        }
        Ok(total)
    }

    fn current_size(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Count an error and convert it for the trait surface.
    fn track<T>(&self, result: Result<T, LmdbCacheError>) -> CacheResult<T> {
        result.map_err(|e| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            CacheError::from(e)
        })
    }
}

#[async_trait]
impl DiskTier for LmdbDiskCache {
    async fn get(&self, key: &str) -> CacheResult<Option<StoredRow>> {
        let row = self.track(self.get_row(key))?;
        match &row {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(row)
    }

    async fn put(&self, row: StoredRow) -> CacheResult<()> {
        self.track(self.put_row(&row))
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.track(self.delete_row(key))
    }

    async fn cleanup(&self) -> CacheResult<u64> {
        self.track(self.cleanup_rows())
    }

    async fn find_by_etag(&self, etag: &str) -> CacheResult<Vec<String>> {
        self.track(self.keys_for_etag(etag))
    }

    async fn clear(&self) -> CacheResult<u64> {
        self.track(self.clear_rows())
    }

    async fn stats(&self) -> CacheResult<DiskStats> {
        let row_count = self.track(self.row_count())?;
        let last = self.last_cleanup.read().ok().and_then(|last| *last);

        Ok(DiskStats {
            row_count,
            size_bytes: self.current_size(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_cleanup_ms: last.map(|r| r.at_ms),
            last_cleanup_removed: last.map(|r| r.removed).unwrap_or(0),
        })
    }
}

fn key_digest(key: &str) -> ContentHash {
    compute_content_hash(key.as_bytes())
}

/// Short printable name for a row known only by digest.
fn digest_label(digest: &[u8]) -> String {
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("#{}", hex)
}

fn timestamp_index_key(timestamp_ms: u64, digest: &ContentHash) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + DIGEST_LEN);
    out.extend_from_slice(&timestamp_ms.to_be_bytes());
    out.extend_from_slice(digest);
    out
}

fn split_timestamp_index_key(bytes: &[u8]) -> Option<(u64, ContentHash)> {
    if bytes.len() != 8 + DIGEST_LEN {
        return None;
    }
    let (ts, digest) = bytes.split_at(8);
    let ts = u64::from_be_bytes(ts.try_into().ok()?);
    Some((ts, digest.try_into().ok()?))
}

fn etag_index_key(etag: &str, digest: &ContentHash) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * DIGEST_LEN);
    out.extend_from_slice(&compute_content_hash(etag.as_bytes()));
    out.extend_from_slice(digest);
    out
}
