//! Ordered write-behind queue into the disk tier.
//!
//! Every coordinator write into the disk tier goes through one unbounded
//! channel drained by a single tokio task, so writes are applied in the
//! order they were issued. Deletes and clears are acknowledged: once `delete`
//! returns, every put queued before it has already been applied and cannot
//! resurrect the key.
//!
//! Rows stay visible through [`WriteBehind::pending`] from the moment they are
//! queued until the worker has applied them, so a value is never in neither
//! tier while its write is in flight.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use wecache_core::{CacheResult, StorageError};

use super::row::StoredRow;
use super::traits::DiskTier;

enum WriteOp {
    Put {
        row: StoredRow,
        seq: u64,
        applied: oneshot::Sender<()>,
    },
    Delete {
        key: String,
        ack: oneshot::Sender<CacheResult<bool>>,
    },
    Clear {
        ack: oneshot::Sender<CacheResult<u64>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Queued puts not yet applied, newest per key.
#[derive(Default)]
struct PendingPuts {
    rows: Mutex<HashMap<String, (u64, StoredRow)>>,
    next_seq: AtomicU64,
}

impl PendingPuts {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, StoredRow)>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget `key` unless a newer put for it was queued since `seq`.
    fn settle(&self, key: &str, seq: u64) {
        let mut rows = self.lock();
        if rows.get(key).is_some_and(|(queued, _)| *queued == seq) {
            rows.remove(key);
        }
    }
}

/// Resolves once a queued put has been attempted against the disk tier.
///
/// Dropping it leaves the put queued.
#[must_use = "drop the receipt to leave the put fire-and-forget"]
pub struct PutReceipt {
    applied: oneshot::Receiver<()>,
}

impl Future for PutReceipt {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A closed channel means the worker is gone; nothing left to wait for.
        Pin::new(&mut self.applied).poll(cx).map(|_| ())
    }
}

/// Handle to the write-behind worker. Cheap to clone.
///
/// The worker exits once every handle has been dropped and the queue is
/// drained.
#[derive(Clone)]
pub struct WriteBehind {
    tx: mpsc::UnboundedSender<WriteOp>,
    pending: Arc<PendingPuts>,
}

impl WriteBehind {
    /// Start the worker on the current tokio runtime.
    pub fn spawn<D: DiskTier>(disk: Arc<D>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingPuts::default());
        let handle = tokio::spawn(run_worker(disk, rx, pending.clone()));
        (Self { tx, pending }, handle)
    }

    /// Queue a put. The returned receipt may be awaited or dropped.
    pub fn enqueue_put(&self, row: StoredRow) -> Result<PutReceipt, StorageError> {
        let (applied, receipt) = oneshot::channel();
        let key = row.key.clone();

        // Held across the send so the index and the queue agree on order.
        let mut rows = self.pending.lock();
        let seq = self.pending.next_seq.fetch_add(1, Ordering::Relaxed);
        rows.insert(key.clone(), (seq, row.clone()));
        if self.tx.send(WriteOp::Put { row, seq, applied }).is_err() {
            rows.remove(&key);
            return Err(StorageError::QueueClosed);
        }
        Ok(PutReceipt { applied: receipt })
    }

    /// The newest queued row for `key` the worker has not applied yet.
    pub fn pending(&self, key: &str) -> Option<StoredRow> {
        self.pending.lock().get(key).map(|(_, row)| row.clone())
    }

    /// Puts queued but not yet applied.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Delete `key` after every previously queued write.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let (ack, done) = oneshot::channel();
        {
            let mut rows = self.pending.lock();
            rows.remove(key);
            self.tx
                .send(WriteOp::Delete {
                    key: key.to_string(),
                    ack,
                })
                .map_err(|_| StorageError::QueueClosed)?;
        }
        done.await.map_err(|_| StorageError::QueueClosed)?
    }

    /// Clear the disk tier after every previously queued write.
    pub async fn clear(&self) -> CacheResult<u64> {
        let (ack, done) = oneshot::channel();
        {
            let mut rows = self.pending.lock();
            rows.clear();
            self.tx
                .send(WriteOp::Clear { ack })
                .map_err(|_| StorageError::QueueClosed)?;
        }
        done.await.map_err(|_| StorageError::QueueClosed)?
    }

    /// Wait until every previously queued write has been applied.
    pub async fn flush(&self) -> CacheResult<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteOp::Flush(ack))
            .map_err(|_| StorageError::QueueClosed)?;
        done.await.map_err(|_| StorageError::QueueClosed)?;
        Ok(())
    }
}

async fn run_worker<D: DiskTier>(
    disk: Arc<D>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    pending: Arc<PendingPuts>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Put { row, seq, applied } => {
                let key = row.key.clone();
                let bytes = row.size_bytes;
                match disk.put(row).await {
                    Ok(()) => tracing::trace!(key = %key, bytes, "disk tier write applied"),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "disk tier write failed");
                    }
                }
                pending.settle(&key, seq);
                let _ = applied.send(());
            }
            WriteOp::Delete { key, ack } => {
                let result = disk.delete(&key).await;
                // Receiver gone means the caller stopped waiting.
                let _ = ack.send(result);
            }
            WriteOp::Clear { ack } => {
                let _ = ack.send(disk.clear().await);
            }
            WriteOp::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    tracing::debug!("write-behind worker stopped");
}
