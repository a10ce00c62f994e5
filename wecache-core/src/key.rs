//! Cache key construction.
//!
//! Repository queries are keyed by a namespace, a hash of the query
//! parameters, and optionally a freshness signal for the backing files.
//! Folding the signal into the key means an edit on disk produces a new key,
//! so stale entries are simply never asked for again and age out.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::freshness::FreshnessSignal;
use crate::hash::compute_content_hash;

/// Separator between key components.
const SEPARATOR: char = ':';

/// Hex characters of the parameter digest kept in the key.
const PARAMS_DIGEST_LEN: usize = 16;

/// A structured cache key rendered as `namespace:params[:signal]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    params_digest: String,
    freshness: Option<FreshnessSignal>,
}

impl CacheKey {
    /// Start building a key in `namespace`.
    pub fn builder(namespace: impl Into<String>) -> CacheKeyBuilder {
        CacheKeyBuilder {
            namespace: namespace.into(),
            params: BTreeMap::new(),
            freshness: None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn params_digest(&self) -> &str {
        &self.params_digest
    }

    pub fn freshness(&self) -> Option<&FreshnessSignal> {
        self.freshness.as_ref()
    }

    /// Pattern matching every key in `namespace`, for pattern invalidation.
    pub fn namespace_pattern(namespace: &str) -> Result<Regex, regex::Error> {
        Regex::new(&format!(
            "^{}{}",
            regex::escape(&sanitize_namespace(namespace)),
            SEPARATOR
        ))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, SEPARATOR, self.params_digest)?;
        if let Some(signal) = &self.freshness {
            write!(f, "{}{}", SEPARATOR, signal)?;
        }
        Ok(())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

/// Builder for [`CacheKey`].
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    namespace: String,
    params: BTreeMap<String, String>,
    freshness: Option<FreshnessSignal>,
}

impl CacheKeyBuilder {
    /// Add a query parameter. Later values for the same name replace earlier ones.
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Attach the source-of-truth signal.
    pub fn freshness(mut self, signal: FreshnessSignal) -> Self {
        self.freshness = Some(signal);
        self
    }

    pub fn build(self) -> CacheKey {
        // Length-prefixed so ("a", "bc") and ("ab", "c") never collide.
        let mut canonical = Vec::new();
        for (name, value) in &self.params {
            canonical.extend_from_slice(&(name.len() as u64).to_le_bytes());
            canonical.extend_from_slice(name.as_bytes());
            canonical.extend_from_slice(&(value.len() as u64).to_le_bytes());
            canonical.extend_from_slice(value.as_bytes());
        }
        let digest = hex::encode(compute_content_hash(&canonical));

        CacheKey {
            namespace: sanitize_namespace(&self.namespace),
            params_digest: digest[..PARAMS_DIGEST_LEN].to_string(),
            freshness: self.freshness,
        }
    }
}

fn sanitize_namespace(namespace: &str) -> String {
    namespace.replace(SEPARATOR, "_")
}
