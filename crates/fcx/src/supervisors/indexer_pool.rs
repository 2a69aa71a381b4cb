//! 📥 IndexWorkerPool: the consumer side.
//!
//! A fixed number of index workers share one [`WorkQueue`] and one [`ActiveTarget`]: the index
//! name every flush writes into. Normally that's the alias. During a reindex the coordinator
//! points it at the new physical index, and points it back when the run ends, either way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::info;

use super::workers::{IndexWorker, Worker};
use super::{WorkerContext, WorkerHandle, join_workers};
use crate::batching::BatchingConfig;
use crate::indexer::BatchIndexer;
use crate::queue::WorkQueue;

/// 🎯 The index name flushes go to. Shared, swapped atomically, read once per flush.
#[derive(Debug, Clone)]
pub struct ActiveTarget(Arc<RwLock<String>>);

impl ActiveTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(name.into())))
    }

    pub fn get(&self) -> String {
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, name: impl Into<String>) {
        *self
            .0
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = name.into();
    }
}

#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub batching: BatchingConfig,
}

#[derive(Debug)]
pub struct IndexWorkerPool {
    queue: WorkQueue,
    indexer: BatchIndexer,
    target: ActiveTarget,
    settings: IndexerSettings,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl IndexWorkerPool {
    pub fn new(
        queue: WorkQueue,
        indexer: BatchIndexer,
        target: ActiveTarget,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            queue,
            indexer,
            target,
            settings,
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Vec<WorkerHandle>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles();
        for i in 0..self.settings.workers {
            let name = format!("indexer-{i}");
            let worker = IndexWorker::new(
                WorkerContext::new(name.clone(), Arc::clone(&self.running)),
                self.queue.clone(),
                self.indexer.clone(),
                self.target.clone(),
                self.settings.batching.clone(),
            );
            handles.push(WorkerHandle {
                name,
                handle: worker.start(),
            });
        }
        info!(workers = self.settings.workers, "🧵 index pool started");
    }

    pub fn target(&self) -> &ActiveTarget {
        &self.target
    }

    /// 💓 Workers whose task hasn't finished. The drain phase refuses to wait on a dead pool.
    pub fn alive_workers(&self) -> usize {
        self.handles().iter().filter(|w| w.is_alive()).count()
    }

    /// 🛑 Flag, bounded join (each worker flushes its last batch), abort stragglers.
    pub async fn stop(&self) -> Vec<String> {
        self.running.store(false, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.handles());
        join_workers("indexer", handles, self.settings.shutdown_timeout).await
    }
}
