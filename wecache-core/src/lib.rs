//! wecache core - shared types for the work-effort cache.
//!
//! Errors, configuration, entries, ETag hashing, clocks, keys, freshness
//! signals and statistics used by the memory tier, the disk tier and the
//! coordinator in `wecache-storage`.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod freshness;
pub mod hash;
pub mod key;
pub mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, DiskTierConfig, MemoryTierConfig};
pub use entry::{decode_value, encode_value, CacheEntry, CacheValue, EntryMetadata};
pub use error::{CacheError, CacheResult, ConfigError, SerializationError, StorageError};
pub use freshness::{CacheRead, FreshnessSignal, Tier};
pub use hash::{compute_content_hash, compute_etag, ContentHash};
pub use key::{CacheKey, CacheKeyBuilder};
pub use stats::{CoordinatorStats, DiskStats, MemoryStats};
