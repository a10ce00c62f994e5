//! Freshness signals and tier-annotated reads.
//!
//! The cache never decides on its own whether content is current relative to
//! the files it was parsed from. Callers fold a [`FreshnessSignal`] into the
//! cache key, or compare the ETag carried by a [`CacheRead`] against one they
//! computed themselves.

use std::fmt;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::hash::compute_etag;

/// Source-of-truth signal describing the state of the backing files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FreshnessSignal {
    /// Latest modification time, epoch milliseconds.
    Mtime(u64),
    /// Hex content hash.
    ContentHash(String),
}

impl FreshnessSignal {
    /// Latest modification time of `path`.
    ///
    /// For a directory this is the newest of the directory itself and its
    /// immediate entries, so adding, removing or editing a record file all
    /// move the signal forward.
    pub fn of_path(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mut latest = mtime_ms(&meta)?;

        if meta.is_dir() {
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                let entry_meta = entry.metadata()?;
                latest = latest.max(mtime_ms(&entry_meta)?);
            }
        }

        Ok(Self::Mtime(latest))
    }

    /// Hash of in-memory content.
    pub fn of_content(bytes: &[u8]) -> Self {
        Self::ContentHash(compute_etag(bytes))
    }
}

impl fmt::Display for FreshnessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mtime(ms) => write!(f, "m{}", ms),
            Self::ContentHash(hash) => write!(f, "h{}", hash),
        }
    }
}

fn mtime_ms(meta: &std::fs::Metadata) -> io::Result<u64> {
    let modified = meta.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(since_epoch.as_millis() as u64)
}

/// Which tier satisfied a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// In-memory LRU.
    Memory,
    /// Persistent disk cache, promoted into memory.
    Disk,
    /// Neither tier; the caller's loader produced the value.
    Loader,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Disk => f.write_str("disk"),
            Self::Loader => f.write_str("loader"),
        }
    }
}

/// Result of a coordinator read, carrying provenance metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    tier: Tier,
    etag: Option<String>,
    cached_at_ms: u64,
}

impl<T> CacheRead<T> {
    pub fn new(value: T, tier: Tier, etag: Option<String>, cached_at_ms: u64) -> Self {
        Self {
            value,
            tier,
            etag,
            cached_at_ms,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Content identifier of the cached value, if known.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// When the value entered the tier that served it.
    pub fn cached_at_ms(&self) -> u64 {
        self.cached_at_ms
    }

    /// True when either tier served the read.
    pub fn was_cache_hit(&self) -> bool {
        self.tier != Tier::Loader
    }

    /// True when `etag` matches the caller's expected content identifier.
    pub fn matches_etag(&self, expected: &str) -> bool {
        self.etag.as_deref() == Some(expected)
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            tier: self.tier,
            etag: self.etag,
            cached_at_ms: self.cached_at_ms,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_display_is_tagged() {
        assert_eq!(FreshnessSignal::Mtime(42).to_string(), "m42");
        let hashed = FreshnessSignal::of_content(b"abc").to_string();
        assert!(hashed.starts_with('h'));
        assert_eq!(hashed.len(), 65);
    }

    #[test]
    fn test_signal_of_directory_tracks_new_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("WE-0001.md"), "---\ntitle: a\n---\n").unwrap();

        let before = FreshnessSignal::of_path(dir.path()).unwrap();
        let FreshnessSignal::Mtime(before_ms) = before else {
            panic!("expected mtime signal");
        };

        let file = dir.path().join("WE-0002.md");
        std::fs::write(&file, "---\ntitle: b\n---\n").unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let FreshnessSignal::Mtime(after_ms) = FreshnessSignal::of_path(dir.path()).unwrap() else {
            panic!("expected mtime signal");
        };
        assert!(after_ms > before_ms);
    }

    #[test]
    fn test_signal_missing_path() {
        assert!(FreshnessSignal::of_path(Path::new("/nonexistent/efforts")).is_err());
    }

    #[test]
    fn test_cache_read_accessors() {
        let read = CacheRead::new("value", Tier::Disk, Some("abc".to_string()), 7);
        assert!(read.was_cache_hit());
        assert!(read.matches_etag("abc"));
        assert!(!read.matches_etag("def"));
        assert_eq!(read.tier(), Tier::Disk);
        assert_eq!(read.cached_at_ms(), 7);
        assert_eq!(read.into_value(), "value");
    }

    #[test]
    fn test_cache_read_from_loader_is_miss() {
        let read = CacheRead::new(42i32, Tier::Loader, None, 0);
        assert!(!read.was_cache_hit());
        assert_eq!(read.etag(), None);
    }

    #[test]
    fn test_cache_read_map() {
        let read = CacheRead::new(42i32, Tier::Memory, None, 1);
        let mapped = read.map(|v| v.to_string());
        assert_eq!(mapped.tier(), Tier::Memory);
        assert_eq!(mapped.into_value(), "42");
    }
}
