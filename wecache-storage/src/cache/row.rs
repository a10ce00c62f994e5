//! Persisted row format for the disk tier.
//!
//! Layout: `[timestamp_ms: u64 LE][size_bytes: u64 LE][key_len: u32 LE][etag_len: u16 LE][key][etag][value]`.
//! The value is the canonical JSON encoding, so `size_bytes == value.len()`
//! for rows written by this crate. The key travels inside the row because
//! LMDB only sees a digest of it.

use serde::{de::DeserializeOwned, Serialize};
use wecache_core::{
    compute_etag, decode_value, encode_value, CacheEntry, EntryMetadata, SerializationError,
    StorageError,
};

const HEADER_LEN: usize = 8 + 8 + 4 + 2;

/// Longest ETag a row can carry.
pub const MAX_ETAG_LEN: usize = u16::MAX as usize;

/// One disk tier row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub key: String,
    /// Canonical encoding of the value.
    pub value: Vec<u8>,
    pub timestamp_ms: u64,
    pub etag: String,
    pub size_bytes: u64,
}

impl StoredRow {
    /// Encode `value` and build a row, computing the ETag when absent.
    pub fn from_value<V: Serialize>(
        key: &str,
        value: &V,
        metadata: EntryMetadata,
        now_ms: u64,
    ) -> Result<Self, SerializationError> {
        let bytes = encode_value(key, value)?;
        Ok(Self::from_encoded(key, bytes, metadata.etag, now_ms))
    }

    /// Build a row around an already encoded value.
    pub fn from_encoded(key: &str, value: Vec<u8>, etag: Option<String>, now_ms: u64) -> Self {
        let etag = etag.unwrap_or_else(|| compute_etag(&value));
        Self {
            key: key.to_string(),
            size_bytes: value.len() as u64,
            value,
            timestamp_ms: now_ms,
            etag,
        }
    }

    /// Re-encode an entry leaving the memory tier. The row is stamped with
    /// `now_ms`, like any other disk write, and keeps the entry's ETag.
    pub fn from_entry<V: Serialize>(
        entry: &CacheEntry<V>,
        now_ms: u64,
    ) -> Result<Self, SerializationError> {
        let bytes = encode_value(&entry.key, &entry.value)?;
        Ok(Self::from_encoded(&entry.key, bytes, entry.etag.clone(), now_ms))
    }

    pub fn decode_value<V: DeserializeOwned>(&self) -> Result<V, SerializationError> {
        decode_value(&self.key, &self.value)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }

    /// Same strict rule as the memory tier: stale once age exceeds the limit.
    pub fn is_expired(&self, now_ms: u64, max_age_ms: u64) -> bool {
        self.age_ms(now_ms) > max_age_ms
    }

    /// Serialize the row. ETags longer than [`MAX_ETAG_LEN`] are rejected,
    /// never cut short.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let key = self.key.as_bytes();
        let etag = self.etag.as_bytes();
        let key_len =
            u32::try_from(key.len()).map_err(|_| StorageError::KeyTooLong { len: key.len() })?;
        let etag_len = u16::try_from(etag.len()).map_err(|_| StorageError::EtagTooLong {
            key: self.key.clone(),
            len: etag.len(),
            max: MAX_ETAG_LEN,
        })?;

        let mut out = Vec::with_capacity(HEADER_LEN + key.len() + etag.len() + self.value.len());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&self.size_bytes.to_le_bytes());
        out.extend_from_slice(&key_len.to_le_bytes());
        out.extend_from_slice(&etag_len.to_le_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(etag);
        out.extend_from_slice(&self.value);
        Ok(out)
    }

    /// Parse a row. `label` names the row in errors, since the key itself
    /// may be unreadable.
    pub fn from_bytes(label: &str, bytes: &[u8]) -> Result<Self, StorageError> {
        let corrupt = |reason: &str| StorageError::Corrupt {
            key: label.to_string(),
            reason: reason.to_string(),
        };

        if bytes.len() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }

        let (ts, rest) = bytes.split_at(8);
        let (size, rest) = rest.split_at(8);
        let (key_len, rest) = rest.split_at(4);
        let (etag_len, rest) = rest.split_at(2);

        let timestamp_ms = u64::from_le_bytes(ts.try_into().map_err(|_| corrupt("timestamp"))?);
        let size_bytes = u64::from_le_bytes(size.try_into().map_err(|_| corrupt("size"))?);
        let key_len =
            u32::from_le_bytes(key_len.try_into().map_err(|_| corrupt("key length"))?) as usize;
        let etag_len =
            u16::from_le_bytes(etag_len.try_into().map_err(|_| corrupt("etag length"))?) as usize;

        if rest.len() < key_len {
            return Err(corrupt("truncated key"));
        }
        let (key, rest) = rest.split_at(key_len);
        let key = std::str::from_utf8(key)
            .map_err(|_| corrupt("key is not utf-8"))?
            .to_string();

        if rest.len() < etag_len {
            return Err(corrupt("truncated etag"));
        }
        let (etag, value) = rest.split_at(etag_len);
        let etag = std::str::from_utf8(etag)
            .map_err(|_| corrupt("etag is not utf-8"))?
            .to_string();

        Ok(Self {
            key,
            value: value.to_vec(),
            timestamp_ms,
            etag,
            size_bytes,
        })
    }
}
