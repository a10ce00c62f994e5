//! Configuration types

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default L1 byte budget (100 MiB).
pub const DEFAULT_MEMORY_MAX_SIZE_BYTES: u64 = 100 * 1024 * 1024;
/// Default L1 entry age (5 minutes).
pub const DEFAULT_MEMORY_MAX_AGE_MS: u64 = 5 * 60 * 1000;
/// Default L2 row age (1 hour).
pub const DEFAULT_DISK_MAX_AGE_MS: u64 = 60 * 60 * 1000;
/// Default LMDB map size in megabytes.
pub const DEFAULT_DISK_MAP_SIZE_MB: usize = 1024;
/// Default interval between L2 cleanup passes (10 minutes).
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 10 * 60 * 1000;
/// Default L2 directory, relative to the working directory.
pub const DEFAULT_DISK_PATH: &str = ".wecache";

/// In-memory (L1) tier configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTierConfig {
    /// Upper bound on the summed encoded size of live entries.
    pub max_size_bytes: u64,
    /// Entries older than this are treated as absent.
    pub max_age: Duration,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MEMORY_MAX_SIZE_BYTES,
            max_age: Duration::from_millis(DEFAULT_MEMORY_MAX_AGE_MS),
        }
    }
}

/// Persistent (L2) tier configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTierConfig {
    /// Directory holding the LMDB environment.
    pub path: PathBuf,
    /// Rows older than this are treated as absent and removed.
    pub max_age: Duration,
    /// LMDB map size in megabytes.
    pub map_size_mb: usize,
    /// How often the background cleanup task runs. `None` disables it.
    pub cleanup_interval: Option<Duration>,
}

impl Default for DiskTierConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DISK_PATH),
            max_age: Duration::from_millis(DEFAULT_DISK_MAX_AGE_MS),
            map_size_mb: DEFAULT_DISK_MAP_SIZE_MB,
            cleanup_interval: Some(Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS)),
        }
    }
}

/// Configuration for the two-tier cache.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheConfig {
    pub memory: MemoryTierConfig,
    pub disk: DiskTierConfig,
    /// Serialise concurrent misses for the same key so only one loader runs.
    pub dedupe_concurrent_loads: bool,
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the L1 byte budget.
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.memory.max_size_bytes = bytes;
        self
    }

    /// Set the L1 entry age limit.
    pub fn with_memory_max_age(mut self, age: Duration) -> Self {
        self.memory.max_age = age;
        self
    }

    /// Set the L2 row age limit.
    pub fn with_disk_max_age(mut self, age: Duration) -> Self {
        self.disk.max_age = age;
        self
    }

    /// Set the L2 directory.
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk.path = path.into();
        self
    }

    /// Set the LMDB map size.
    pub fn with_map_size_mb(mut self, mb: usize) -> Self {
        self.disk.map_size_mb = mb;
        self
    }

    /// Set or disable the periodic cleanup interval.
    pub fn with_cleanup_interval(mut self, interval: Option<Duration>) -> Self {
        self.disk.cleanup_interval = interval;
        self
    }

    /// Enable or disable single-flight loading.
    pub fn with_dedupe(mut self, enabled: bool) -> Self {
        self.dedupe_concurrent_loads = enabled;
        self
    }

    /// Create a CacheConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `WECACHE_MEMORY_MAX_SIZE_BYTES` (default: 104857600)
    /// - `WECACHE_MEMORY_MAX_AGE_MS` (default: 300000)
    /// - `WECACHE_DISK_PATH` (default: `.wecache`)
    /// - `WECACHE_DISK_MAX_AGE_MS` (default: 3600000)
    /// - `WECACHE_DISK_MAP_SIZE_MB` (default: 1024)
    /// - `WECACHE_CLEANUP_INTERVAL_MS` (default: 600000, `0` disables)
    /// - `WECACHE_DEDUPE_LOADS` (default: false)
    pub fn from_env() -> Self {
        let cleanup_ms = env_parse("WECACHE_CLEANUP_INTERVAL_MS", DEFAULT_CLEANUP_INTERVAL_MS);

        Self {
            memory: MemoryTierConfig {
                max_size_bytes: env_parse(
                    "WECACHE_MEMORY_MAX_SIZE_BYTES",
                    DEFAULT_MEMORY_MAX_SIZE_BYTES,
                ),
                max_age: Duration::from_millis(env_parse(
                    "WECACHE_MEMORY_MAX_AGE_MS",
                    DEFAULT_MEMORY_MAX_AGE_MS,
                )),
            },
            disk: DiskTierConfig {
                path: std::env::var("WECACHE_DISK_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_DISK_PATH)),
                max_age: Duration::from_millis(env_parse(
                    "WECACHE_DISK_MAX_AGE_MS",
                    DEFAULT_DISK_MAX_AGE_MS,
                )),
                map_size_mb: env_parse("WECACHE_DISK_MAP_SIZE_MB", DEFAULT_DISK_MAP_SIZE_MB),
                cleanup_interval: (cleanup_ms > 0).then(|| Duration::from_millis(cleanup_ms)),
            },
            dedupe_concurrent_loads: std::env::var("WECACHE_DEDUPE_LOADS")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }

    /// Load a CacheConfig from a TOML file. Missing fields take defaults.
    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse a CacheConfig from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: CacheConfigFile = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        Ok(file.into())
    }

    /// Reject configurations the tiers cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.max_size_bytes == 0 {
            return Err(invalid("memory.max_size_bytes", "0", "must be > 0"));
        }
        if self.memory.max_age.is_zero() {
            return Err(invalid("memory.max_age_ms", "0", "must be > 0"));
        }
        if self.disk.max_age.is_zero() {
            return Err(invalid("disk.max_age_ms", "0", "must be > 0"));
        }
        if self.disk.map_size_mb == 0 {
            return Err(invalid("disk.map_size_mb", "0", "must be > 0"));
        }
        if self.disk.path.as_os_str().is_empty() {
            return Err(invalid("disk.path", "", "must not be empty"));
        }
        if let Some(interval) = self.disk.cleanup_interval {
            if interval.is_zero() {
                return Err(invalid("disk.cleanup_interval_ms", "0", "must be > 0"));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// On-disk TOML shape. Durations are plain millisecond integers.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CacheConfigFile {
    memory: MemorySection,
    disk: DiskSection,
    dedupe_concurrent_loads: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MemorySection {
    max_size_bytes: u64,
    max_age_ms: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MEMORY_MAX_SIZE_BYTES,
            max_age_ms: DEFAULT_MEMORY_MAX_AGE_MS,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DiskSection {
    path: PathBuf,
    max_age_ms: u64,
    map_size_mb: usize,
    cleanup_interval_ms: u64,
}

impl Default for DiskSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DISK_PATH),
            max_age_ms: DEFAULT_DISK_MAX_AGE_MS,
            map_size_mb: DEFAULT_DISK_MAP_SIZE_MB,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
        }
    }
}

impl From<CacheConfigFile> for CacheConfig {
    fn from(file: CacheConfigFile) -> Self {
        Self {
            memory: MemoryTierConfig {
                max_size_bytes: file.memory.max_size_bytes,
                max_age: Duration::from_millis(file.memory.max_age_ms),
            },
            disk: DiskTierConfig {
                path: file.disk.path,
                max_age: Duration::from_millis(file.disk.max_age_ms),
                map_size_mb: file.disk.map_size_mb,
                cleanup_interval: (file.disk.cleanup_interval_ms > 0)
                    .then(|| Duration::from_millis(file.disk.cleanup_interval_ms)),
            },
            dedupe_concurrent_loads: file.dedupe_concurrent_loads,
        }
    }
}
