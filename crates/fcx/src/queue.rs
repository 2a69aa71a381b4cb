//! ✉️ WorkQueue: the one thing loaders and indexers are allowed to share.
//!
//! An unbounded MPMC channel of batches. Pushing never blocks, popping never waits.
//! `size()` is a vibe check for the batching heuristics; `outstanding()` is the real
//! ledger the reindex drain waits on (items pushed but not yet reported done by a worker).

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_channel::{Receiver, Sender, TryRecvError};
use tracing::warn;

use crate::common::WorkItem;

#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: Sender<Vec<WorkItem>>,
    rx: Receiver<Vec<WorkItem>>,
    outstanding: Arc<AtomicUsize>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 📥 Enqueue a batch. Unbounded, so this only fails if the queue was closed,
    /// which we never do while a clone is alive.
    pub fn push(&self, batch: Vec<WorkItem>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        self.outstanding.fetch_add(count, Ordering::SeqCst);
        if let Err(err) = self.tx.try_send(batch) {
            // -- 💀 closed channel. give the ledger back so a drain doesn't wait forever.
            self.outstanding.fetch_sub(count, Ordering::SeqCst);
            warn!(dropped = count, "💀 WorkQueue is closed, batch dropped: {err}");
        }
    }

    /// 📤 Non-blocking pop. `None` means empty right now, not empty forever.
    pub fn try_pop(&self) -> Option<Vec<WorkItem>> {
        match self.rx.try_recv() {
            Ok(batch) => Some(batch),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// 📏 Approximate number of queued batches. Heuristics only.
    pub fn size(&self) -> usize {
        self.rx.len()
    }

    /// 🧾 Items pushed and not yet completed by a consumer.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// ✅ A consumer finished with `count` items (flushed, failed, or discarded: all count).
    pub fn complete(&self, count: usize) {
        // -- saturating, so a double report can't wrap the ledger into the stratosphere
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(count))
            });
    }
}
