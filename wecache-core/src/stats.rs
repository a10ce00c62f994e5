//! Statistics snapshots for both tiers and the coordinator.

/// Snapshot of in-memory tier counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: u64,
    pub max_size: u64,
    pub entry_count: u64,
}

impl MemoryStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits, self.misses)
    }
}

/// Snapshot of disk tier counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskStats {
    /// Rows currently stored.
    pub row_count: u64,
    /// Summed encoded size of stored rows.
    pub size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// Read or write failures since open.
    pub errors: u64,
    /// When `cleanup` last completed, epoch milliseconds.
    pub last_cleanup_ms: Option<u64>,
    /// Rows removed by the last `cleanup`.
    pub last_cleanup_removed: u64,
}

impl DiskStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits, self.misses)
    }
}

/// Combined statistics reported by the coordinator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorStats {
    pub memory: MemoryStats,
    pub disk: DiskStats,
    /// Loader invocations.
    pub loads: u64,
    /// Loader invocations that returned an error.
    pub load_failures: u64,
    /// Disk hits copied back into memory.
    pub promotions: u64,
    /// Memory evictions demoted to disk.
    pub write_backs: u64,
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
