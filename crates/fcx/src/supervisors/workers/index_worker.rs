//! 🗑️ The IndexWorker: drains the work queue into a private batch and flushes it when the
//! adaptive rules say so.
//!
//! One iteration:
//! 1. recalculate the target batch size from queue length and recent flush timings;
//! 2. pop batches without waiting until the target is reached or the queue is empty;
//! 3. flush if `should_flush` says yes (transform, bulk insert, verify, clear);
//! 4. nap briefly if nothing was drained.
//!
//! While a flush is in flight this worker drains nothing. That is the backpressure.
//! On a graceful stop a non-empty batch is flushed exactly once on the way out.

use std::time::Instant;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Worker;
use crate::batching::{
    BatchingConfig, ProcessingTimes, calculate_optimal_batch_size, idle_backoff, should_flush,
};
use crate::common::RecordBatch;
use crate::indexer::BatchIndexer;
use crate::queue::WorkQueue;
use crate::supervisors::WorkerContext;
use crate::supervisors::indexer_pool::ActiveTarget;

#[derive(Debug)]
pub(crate) struct IndexWorker {
    ctx: WorkerContext,
    queue: WorkQueue,
    indexer: BatchIndexer,
    target: ActiveTarget,
    batching: BatchingConfig,
    batch: RecordBatch,
    timings: ProcessingTimes,
}

impl IndexWorker {
    pub(crate) fn new(
        ctx: WorkerContext,
        queue: WorkQueue,
        indexer: BatchIndexer,
        target: ActiveTarget,
        batching: BatchingConfig,
    ) -> Self {
        Self {
            ctx,
            queue,
            indexer,
            target,
            batching,
            batch: RecordBatch::new(),
            timings: ProcessingTimes::default(),
        }
    }

    /// 🚿 Take everything in the batch, index it, and report it done to the queue ledger,
    /// whatever the outcome. Errors were already counted by the indexer; here they're logged.
    async fn flush(&mut self) {
        let items = self.batch.take();
        let count = items.len();
        if count == 0 {
            return;
        }
        let target = self.target.get();
        let started = Instant::now();
        match self.indexer.index(items, &target).await {
            Ok(landed) => debug!(
                worker = self.ctx.name(),
                index = %target,
                landed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "🚀 flushed"
            ),
            Err(err) => warn!(
                worker = self.ctx.name(),
                index = %target,
                kind = err.kind(),
                failed = err.failed_ids().len(),
                "💀 flush failed, batch dropped: {err}"
            ),
        }
        self.timings.record(started.elapsed());
        self.queue.complete(count);
    }
}

impl Worker for IndexWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!(worker = self.ctx.name(), "📥 index worker started");
            let mut target_size = self.batching.bound(self.batching.min_batch_size);
            let mut last_flush = Instant::now();

            while self.ctx.is_running() {
                target_size = calculate_optimal_batch_size(
                    target_size,
                    self.queue.size(),
                    self.timings.average(),
                    &self.batching,
                );

                let mut drained = 0;
                while self.batch.len() < target_size {
                    let Some(items) = self.queue.try_pop() else {
                        break;
                    };
                    drained += items.len();
                    self.batch.extend(items);
                }

                if should_flush(
                    self.batch.len(),
                    self.queue.size(),
                    last_flush.elapsed(),
                    &self.batching,
                ) {
                    self.flush().await;
                    last_flush = Instant::now();
                    continue;
                }

                if drained == 0 {
                    let nap = idle_backoff(self.queue.size(), !self.batch.is_empty(), &self.batching);
                    tokio::time::sleep(nap).await;
                }
            }

            // -- 🏁 graceful exit: whatever is left goes out exactly once
            if !self.batch.is_empty() {
                debug!(worker = self.ctx.name(), pending = self.batch.len(), "🧹 final flush");
                self.flush().await;
            }
            debug!(worker = self.ctx.name(), "🛑 index worker stopped");
            Ok(())
        })
    }
}
