//! Periodic disk tier cleanup.
//!
//! Lazy expiry on `get` keeps reads correct on its own; this task bounds how
//! much dead data the disk tier carries between reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::traits::DiskTier;

/// Counters for the cleanup task.
#[derive(Debug, Default)]
pub struct CleanupMetrics {
    /// Cleanup passes completed.
    pub cycles: AtomicU64,
    /// Rows removed across all passes.
    pub rows_removed: AtomicU64,
    /// Passes that failed.
    pub errors: AtomicU64,
}

impl CleanupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CleanupSnapshot {
        CleanupSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            rows_removed: self.rows_removed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CleanupMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSnapshot {
    pub cycles: u64,
    pub rows_removed: u64,
    pub errors: u64,
}

/// Run `cleanup` every `period` until `shutdown_rx` turns true or its
/// sender is dropped.
///
/// The first pass runs immediately. Missed ticks are skipped rather than
/// bunched up.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = spawn_cleanup_task(disk.clone(), Duration::from_secs(600), shutdown_rx);
///
/// // Later
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn cleanup_task<D: DiskTier>(
    disk: Arc<D>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<CleanupMetrics> {
    let metrics = Arc::new(CleanupMetrics::new());

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = period.as_millis() as u64,
        "Disk cleanup task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Disk cleanup task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                run_cycle(disk.as_ref(), &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        removed = snapshot.rows_removed,
        errors = snapshot.errors,
        "Disk cleanup task completed"
    );

    metrics
}

/// Spawn [`cleanup_task`] on the current runtime.
pub fn spawn_cleanup_task<D: DiskTier>(
    disk: Arc<D>,
    period: Duration,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<Arc<CleanupMetrics>> {
    tokio::spawn(cleanup_task(disk, period, shutdown_rx))
}

async fn run_cycle<D: DiskTier>(disk: &D, metrics: &CleanupMetrics) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    match disk.cleanup().await {
        Ok(0) => tracing::trace!("Disk cleanup found nothing to remove"),
        Ok(removed) => {
            metrics.rows_removed.fetch_add(removed, Ordering::Relaxed);
            tracing::info!(removed, "Disk cleanup removed stale rows");
        }
        Err(e) => {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "Disk cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::LmdbDiskCache;
    use tempfile::TempDir;
    use wecache_core::{Clock, EntryMetadata, ManualClock};

    #[tokio::test]
    async fn test_first_tick_cleans_and_shutdown_stops() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let disk = Arc::new(LmdbDiskCache::open_path(dir.path(), 10, 100, clock.clone()).unwrap());
        disk.set("old", &"v", EntryMetadata::new()).unwrap();
        clock.advance_ms(500);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_cleanup_task(disk.clone(), Duration::from_secs(3600), shutdown_rx);

        // The immediate first tick removes the stale row.
        for _ in 0..100 {
            if disk.stats().await.unwrap().last_cleanup_ms == Some(clock.now_ms()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown_tx.send(true).unwrap();
        let metrics = handle.await.unwrap().snapshot();
        assert_eq!(metrics.cycles, 1);
        assert_eq!(metrics.rows_removed, 1);
        assert_eq!(metrics.errors, 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_task() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let disk = Arc::new(LmdbDiskCache::open_path(dir.path(), 10, 100, clock).unwrap());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_cleanup_task(disk, Duration::from_secs(3600), shutdown_rx);
        drop(shutdown_tx);

        let metrics = handle.await.unwrap().snapshot();
        assert!(metrics.cycles <= 1);
    }
}
