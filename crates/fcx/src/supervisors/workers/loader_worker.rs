//! 🚰 The LoaderWorker: takes an id off the id channel, fetches the record, drops it in the queue.
//!
//! 🎬 *[the queue is full. the loader stares at it. the loader waits.]*
//!
//! Three rules, in this order:
//! 1. If the work queue is above the high-water mark, pause before fetching anything.
//! 2. Fetch with bounded retry. Three strikes and the id is dropped, logged, counted.
//! 3. Success is pushed as a single-item batch. Exactly once. No retry after a push.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_channel::Receiver;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Worker;
use crate::backends::MetadataSourceBackend;
use crate::common::{WorkItem, entity_key};
use crate::queue::WorkQueue;
use crate::stats::StatsCollector;
use crate::supervisors::WorkerContext;
use crate::supervisors::loader_pool::{LoaderSettings, fetch_with_retry};

/// 🎟️ An id, stamped with the wildcard load that enumerated it.
#[derive(Debug, Clone)]
pub(crate) struct IdTicket {
    pub(crate) generation: u64,
    pub(crate) id: String,
}

#[derive(Debug, Default)]
struct Tally {
    generation: u64,
    fetched: usize,
    dropped: usize,
}

/// 📈 What the current wildcard load has settled so far.
///
/// Only tickets of the current generation count. An aborted load leaves ids in the channel and
/// fetches in flight; once the generation moves on they are skipped and never counted.
#[derive(Debug, Default)]
pub(crate) struct LoadProgress {
    tally: Mutex<Tally>,
    pub(crate) changed: Notify,
}

impl LoadProgress {
    fn lock(&self) -> MutexGuard<'_, Tally> {
        self.tally
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 🎬 Start a new generation with zeroed counters. Everything older is now stale.
    pub(crate) fn next_generation(&self) -> u64 {
        let mut tally = self.lock();
        tally.generation += 1;
        tally.fetched = 0;
        tally.dropped = 0;
        tally.generation
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// (fetched, dropped) for `generation`, or zeros once it has been superseded.
    pub(crate) fn counts(&self, generation: u64) -> (usize, usize) {
        let tally = self.lock();
        if tally.generation == generation {
            (tally.fetched, tally.dropped)
        } else {
            (0, 0)
        }
    }

    /// ✅ Count a fetched record and run `push` in the same critical section, so a record
    /// from a superseded load never reaches the queue. Returns whether it counted.
    fn settle_fetched(&self, generation: u64, push: impl FnOnce()) -> bool {
        {
            let mut tally = self.lock();
            if tally.generation != generation {
                return false;
            }
            push();
            tally.fetched += 1;
        }
        self.changed.notify_waiters();
        true
    }

    fn settle_dropped(&self, generation: u64) -> bool {
        {
            let mut tally = self.lock();
            if tally.generation != generation {
                return false;
            }
            tally.dropped += 1;
        }
        self.changed.notify_waiters();
        true
    }
}

#[derive(Debug)]
pub(crate) struct LoaderWorker {
    ctx: WorkerContext,
    ids: Receiver<IdTicket>,
    source: Arc<MetadataSourceBackend>,
    queue: WorkQueue,
    stats: Arc<StatsCollector>,
    progress: Arc<LoadProgress>,
    settings: LoaderSettings,
}

impl LoaderWorker {
    pub(crate) fn new(
        ctx: WorkerContext,
        ids: Receiver<IdTicket>,
        source: Arc<MetadataSourceBackend>,
        queue: WorkQueue,
        stats: Arc<StatsCollector>,
        progress: Arc<LoadProgress>,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            ctx,
            ids,
            source,
            queue,
            stats,
            progress,
            settings,
        }
    }

    async fn load_one(&self, ticket: IdTicket) {
        let ctx = &self.ctx;
        let IdTicket { generation, id } = ticket;
        if !self.progress.is_current(generation) {
            debug!(worker = ctx.name(), id = %id, generation, "🗑️ id from an abandoned load, skipping");
            return;
        }
        let progress = &self.progress;
        let still_wanted = || ctx.is_running() && progress.is_current(generation);
        match fetch_with_retry(&self.source, &id, self.settings.retry_delay, still_wanted).await {
            Ok(record) => {
                let queue = &self.queue;
                let pushed = self.progress.settle_fetched(generation, || {
                    queue.push(vec![WorkItem::new(id.clone(), record)]);
                });
                if !pushed {
                    debug!(worker = ctx.name(), id = %id, "🗑️ load was abandoned mid-fetch, record discarded");
                }
            }
            Err(err) => {
                warn!(worker = ctx.name(), id = %id, "💀 giving up on record: {err}");
                if self.progress.settle_dropped(generation) {
                    self.stats.record_error(&entity_key(&id), 1);
                }
            }
        }
    }
}

impl Worker for LoaderWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!(worker = self.ctx.name(), "🚀 loader worker started");
            while self.ctx.is_running() {
                // -- 🧯 backpressure: the indexers are behind, don't pile on
                if self.queue.size() > self.settings.high_water {
                    debug!(
                        worker = self.ctx.name(),
                        backlog = self.queue.size(),
                        "⏸️ queue above high water, pausing"
                    );
                    tokio::time::sleep(self.settings.backpressure_pause).await;
                    continue;
                }

                match tokio::time::timeout(self.settings.poll_interval, self.ids.recv()).await {
                    Ok(Ok(ticket)) => self.load_one(ticket).await,
                    Ok(Err(_)) => {
                        debug!(worker = self.ctx.name(), "🏁 id channel closed");
                        break;
                    }
                    // -- nothing to do this tick, go check the flag again
                    Err(_) => {}
                }
            }
            debug!(worker = self.ctx.name(), "🛑 loader worker stopped");
            Ok(())
        })
    }
}
