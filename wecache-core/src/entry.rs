//! Cache entries and value encoding.

use crate::error::SerializationError;
use serde::{de::DeserializeOwned, Serialize};

/// Marker trait for values the cache can hold.
///
/// Values are opaque to the cache: it only needs to clone them for readers
/// and serialize them to measure size, compute ETags and persist to disk.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Caller-supplied metadata for a `set`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Content identifier. Computed from the encoded value when absent.
    pub etag: Option<String>,
}

impl EntryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_etag(etag: impl Into<String>) -> Self {
        Self {
            etag: Some(etag.into()),
        }
    }
}

/// A live cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    /// When the entry was written, in epoch milliseconds.
    pub timestamp_ms: u64,
    pub hit_count: u32,
    /// Length of the canonical encoding of `value`.
    pub size_bytes: u64,
    pub etag: Option<String>,
}

impl<V> CacheEntry<V> {
    pub fn new(
        key: impl Into<String>,
        value: V,
        timestamp_ms: u64,
        size_bytes: u64,
        etag: Option<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp_ms,
            hit_count: 0,
            size_bytes,
            etag,
        }
    }

    /// Age relative to `now_ms`. Clock skew backwards reads as zero.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }

    /// An entry is expired once its age strictly exceeds `max_age_ms`.
    pub fn is_expired(&self, now_ms: u64, max_age_ms: u64) -> bool {
        self.age_ms(now_ms) > max_age_ms
    }
}

/// Canonical encoding used for size accounting, ETags and the disk tier.
pub fn encode_value<V: Serialize>(key: &str, value: &V) -> Result<Vec<u8>, SerializationError> {
    serde_json::to_vec(value).map_err(|e| SerializationError::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Inverse of [`encode_value`].
pub fn decode_value<V: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<V, SerializationError> {
    serde_json::from_slice(bytes).map_err(|e| SerializationError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
