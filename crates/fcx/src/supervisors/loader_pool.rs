//! 📡 EntityLoaderPool: the producer side.
//!
//! A wildcard load pages through id enumeration for every registered entity type and feeds the
//! ids into a bounded channel. A fixed set of loader workers drains that channel concurrently,
//! so fetching starts while enumeration is still paging.
//!
//! 🧠 Retry policy, shared by enumeration pages and record fetches:
//! [`MAX_FETCH_ATTEMPTS`] attempts total, fixed delay between them.
//! - a record that fails every attempt is dropped and counted; the pool carries on;
//! - an enumeration page that fails every attempt aborts the whole load. A half-enumerated
//!   universe must never be swapped in as "everything".

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::workers::{IdTicket, LoadProgress, LoaderWorker, Worker};
use super::{WorkerContext, WorkerHandle, join_workers};
use crate::backends::{MetadataSource, MetadataSourceBackend};
use crate::errors::{IndexerError, IndexerResult};
use crate::queue::WorkQueue;
use crate::registry::{EntityDescriptor, EntityRegistry};
use crate::stats::StatsCollector;

/// 🔁 Attempts per fetch, first try included.
pub const MAX_FETCH_ATTEMPTS: u32 = 3;

// -- 📣 one progress line per this many enumerated ids
const ENUMERATION_LOG_EVERY: usize = 100;

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub workers: usize,
    pub page_size: usize,
    pub retry_delay: Duration,
    pub high_water: usize,
    pub backpressure_pause: Duration,
    pub id_buffer: usize,
    pub shutdown_timeout: Duration,
    /// ⏱️ How long a worker blocks on the id channel before re-checking its running flag.
    pub poll_interval: Duration,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            page_size: 1000,
            retry_delay: Duration::from_secs(10),
            high_water: 1000,
            backpressure_pause: Duration::from_secs(1),
            id_buffer: 10_000,
            shutdown_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// 📋 What a wildcard load did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub enumerated: usize,
    pub fetched: usize,
    pub dropped: usize,
}

/// 🔁 Bounded retry around any fallible call. `keep_going` is asked before each wait so a
/// stopping pool doesn't sit out the full delay.
pub(crate) async fn retry_bounded<T, F, Fut>(
    what: &str,
    delay: Duration,
    keep_going: impl Fn() -> bool,
    mut call: F,
) -> IndexerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IndexerResult<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_FETCH_ATTEMPTS && keep_going() => {
                warn!(
                    attempt,
                    max = MAX_FETCH_ATTEMPTS,
                    delay_ms = delay.as_millis() as u64,
                    "🔄 {what} failed, retrying: {err}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub(crate) async fn fetch_with_retry(
    source: &MetadataSourceBackend,
    id: &str,
    delay: Duration,
    keep_going: impl Fn() -> bool,
) -> IndexerResult<Value> {
    retry_bounded(&format!("fetch of '{id}'"), delay, keep_going, || source.fetch(id)).await
}

#[derive(Debug)]
pub struct EntityLoaderPool {
    source: Arc<MetadataSourceBackend>,
    registry: Arc<EntityRegistry>,
    queue: WorkQueue,
    stats: Arc<StatsCollector>,
    settings: LoaderSettings,
    id_tx: Sender<IdTicket>,
    id_rx: Receiver<IdTicket>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<WorkerHandle>>,
    progress: Arc<LoadProgress>,
}

impl EntityLoaderPool {
    pub fn new(
        source: Arc<MetadataSourceBackend>,
        registry: Arc<EntityRegistry>,
        queue: WorkQueue,
        stats: Arc<StatsCollector>,
        settings: LoaderSettings,
    ) -> Self {
        let (id_tx, id_rx) = async_channel::bounded(settings.id_buffer.max(1));
        Self {
            source,
            registry,
            queue,
            stats,
            settings,
            id_tx,
            id_rx,
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            progress: Arc::new(LoadProgress::default()),
        }
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Vec<WorkerHandle>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 🚀 Spawn the loader workers. Calling it on a running pool is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles();
        for i in 0..self.settings.workers {
            let name = format!("loader-{i}");
            let worker = LoaderWorker::new(
                WorkerContext::new(name.clone(), Arc::clone(&self.running)),
                self.id_rx.clone(),
                Arc::clone(&self.source),
                self.queue.clone(),
                Arc::clone(&self.stats),
                Arc::clone(&self.progress),
                self.settings.clone(),
            );
            handles.push(WorkerHandle {
                name,
                handle: worker.start(),
            });
        }
        info!(workers = self.settings.workers, "🧵 loader pool started");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn alive_workers(&self) -> usize {
        self.handles().iter().filter(|w| w.is_alive()).count()
    }

    /// 🌍 Enumerate every registered entity and wait until each id was pushed or dropped.
    ///
    /// Each call opens a new load generation. Ids left behind by an aborted load are skipped
    /// by the workers and never count towards this one.
    pub async fn load_all(&self) -> IndexerResult<LoadSummary> {
        if !self.is_running() {
            return Err(IndexerError::lifecycle("load", "loader pool", "pool is not running"));
        }
        let generation = self.progress.next_generation();

        let mut enumerated = 0;
        for entity in self.registry.entities() {
            match self.enumerate_entity(entity, generation).await {
                Ok(sent) => enumerated += sent,
                Err(err) => {
                    self.abandon(generation);
                    return Err(err);
                }
            }
        }
        info!(enumerated, generation, "📇 enumeration complete, waiting for loaders");

        // -- ⏳ wait for the workers to settle every id we handed out
        loop {
            let changed = self.progress.changed.notified();
            let (fetched, dropped) = self.progress.counts(generation);
            if fetched + dropped >= enumerated {
                let summary = LoadSummary {
                    enumerated,
                    fetched,
                    dropped,
                };
                info!(
                    enumerated = summary.enumerated,
                    fetched = summary.fetched,
                    dropped = summary.dropped,
                    "✅ wildcard load settled"
                );
                return Ok(summary);
            }
            if !self.is_running() || self.alive_workers() == 0 {
                self.abandon(generation);
                return Err(IndexerError::lifecycle(
                    "load",
                    "loader pool",
                    format!(
                        "pool stopped with {} of {enumerated} ids unsettled",
                        enumerated.saturating_sub(fetched + dropped)
                    ),
                ));
            }
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    /// 🗑️ Retire an aborted load: its queued ids are thrown away and fetches still in flight
    /// find their generation gone when they come back.
    fn abandon(&self, generation: u64) {
        self.progress.next_generation();
        let mut discarded = 0;
        while self.id_rx.try_recv().is_ok() {
            discarded += 1;
        }
        warn!(generation, discarded, "🗑️ wildcard load abandoned");
    }

    async fn enumerate_entity(
        &self,
        entity: &EntityDescriptor,
        generation: u64,
    ) -> IndexerResult<usize> {
        let started = Instant::now();
        let page_size = self.settings.page_size.max(1);
        let mut sent = 0;
        let mut offset = 0;
        loop {
            let running = &self.running;
            let page = retry_bounded(
                &format!("enumeration of {} at offset {offset}", entity.name),
                self.settings.retry_delay,
                || running.load(Ordering::SeqCst),
                || self.source.enumerate(entity, offset, page_size),
            )
            .await?;
            let page_len = page.len();

            for id in page {
                if self.id_tx.send(IdTicket { generation, id }).await.is_err() {
                    return Err(IndexerError::lifecycle(
                        "load",
                        "loader pool",
                        "id channel closed mid-enumeration",
                    ));
                }
                sent += 1;
                if sent % ENUMERATION_LOG_EVERY == 0 {
                    info!(
                        entity = %entity.name,
                        enumerated = sent,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "📇 enumerating"
                    );
                }
            }

            if page_len < page_size {
                break;
            }
            offset += page_len;
        }
        debug!(entity = %entity.name, total = sent, elapsed_ms = started.elapsed().as_millis() as u64, "📇 entity enumerated");
        Ok(sent)
    }

    /// 🎯 Fetch a single record with the same retry policy. The work queue is not touched.
    ///
    /// Doesn't care whether the pool is running: a single-id trigger gets all its attempts.
    pub async fn fetch_one(&self, id: &str) -> IndexerResult<Value> {
        fetch_with_retry(&self.source, id, self.settings.retry_delay, || true).await
    }

    /// 🛑 Flag, bounded join, abort. Returns the names of workers that did not exit cleanly.
    pub async fn stop(&self) -> Vec<String> {
        self.running.store(false, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.handles());
        join_workers("loader", handles, self.settings.shutdown_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryMetadataSource;
    use crate::registry::EntityConfig;
    use crate::stats::StatsMode;
    use serde_json::json;

    fn settings() -> LoaderSettings {
        LoaderSettings {
            workers: 2,
            page_size: 2,
            retry_delay: Duration::from_millis(5),
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(1),
            ..LoaderSettings::default()
        }
    }

    fn pool_with(
        graph: &InMemoryMetadataSource,
        settings: LoaderSettings,
    ) -> (EntityLoaderPool, WorkQueue, Arc<StatsCollector>) {
        pool_for(graph, &["Person"], settings)
    }

    fn pool_for(
        graph: &InMemoryMetadataSource,
        entities: &[&str],
        settings: LoaderSettings,
    ) -> (EntityLoaderPool, WorkQueue, Arc<StatsCollector>) {
        let configs: Vec<EntityConfig> = entities
            .iter()
            .map(|name| EntityConfig {
                name: (*name).into(),
                rule_set: None,
                path_segment: None,
            })
            .collect();
        let registry = EntityRegistry::new(&configs, "generic").expect("registry");
        let queue = WorkQueue::new();
        let stats = Arc::new(StatsCollector::new(StatsMode::Accumulate));
        let pool = EntityLoaderPool::new(
            Arc::new(MetadataSourceBackend::InMemory(graph.clone())),
            Arc::new(registry),
            queue.clone(),
            Arc::clone(&stats),
            settings,
        );
        (pool, queue, stats)
    }

    fn drain_ids(queue: &WorkQueue) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(batch) = queue.try_pop() {
            assert_eq!(batch.len(), 1, "loaders push single-item batches");
            ids.extend(batch.into_iter().map(|item| item.id));
        }
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn the_one_where_twice_bitten_third_time_lucky_pushes_once() {
        let graph = InMemoryMetadataSource::new();
        graph.insert("Person", "person/P1", json!({"name": "Ada"}));
        graph.fail_fetch("person/P1", 2);
        let (pool, queue, stats) = pool_with(&graph, settings());
        pool.start();

        let summary = pool.load_all().await.expect("load should settle");
        assert_eq!(summary, LoadSummary { enumerated: 1, fetched: 1, dropped: 0 });
        assert_eq!(drain_ids(&queue), vec!["person/P1".to_string()]);
        assert_eq!(graph.fetch_calls("person/P1"), 3);
        assert!(stats.snapshot().error.is_empty());
        pool.stop().await;
    }

    #[tokio::test]
    async fn the_one_where_three_strikes_drop_the_record_but_not_the_pool() {
        let graph = InMemoryMetadataSource::new();
        graph.insert("Person", "person/P1", json!({"name": "Ada"}));
        graph.insert("Person", "person/P2", json!({"name": "Grace"}));
        graph.insert("Person", "person/P3", json!({"name": "Edsger"}));
        graph.fail_fetch("person/P2", 3);
        let (pool, queue, stats) = pool_with(&graph, settings());
        pool.start();

        let summary = pool.load_all().await.expect("a dropped record is not fatal");
        assert_eq!(summary, LoadSummary { enumerated: 3, fetched: 2, dropped: 1 });
        assert_eq!(
            drain_ids(&queue),
            vec!["person/P1".to_string(), "person/P3".to_string()]
        );
        assert_eq!(graph.fetch_calls("person/P2"), MAX_FETCH_ATTEMPTS);
        assert_eq!(stats.snapshot().error.get("person"), Some(&1));
        assert_eq!(pool.alive_workers(), 2, "pool survives");
        assert!(pool.stop().await.is_empty(), "everyone exits cleanly");
    }

    #[tokio::test]
    async fn the_one_where_a_dead_enumeration_page_aborts_the_load() {
        let graph = InMemoryMetadataSource::new();
        graph.insert("Person", "person/P1", json!({}));
        graph.break_enumeration("Person");
        let (pool, queue, _) = pool_with(&graph, settings());
        pool.start();

        let err = pool.load_all().await.expect_err("enumeration failure is fatal");
        assert_eq!(err.kind(), "fetch");
        assert_eq!(queue.outstanding(), 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn the_one_where_pages_keep_coming_until_a_short_one() {
        let graph = InMemoryMetadataSource::new();
        for i in 0..5 {
            graph.insert("Person", &format!("person/P{i}"), json!({"n": i}));
        }
        let (pool, queue, _) = pool_with(&graph, settings());
        pool.start();
        let summary = pool.load_all().await.expect("load");
        assert_eq!(summary.enumerated, 5);
        assert_eq!(drain_ids(&queue).len(), 5);
        pool.stop().await;
    }

    #[tokio::test]
    async fn the_one_where_a_full_queue_makes_loaders_wait() {
        let graph = InMemoryMetadataSource::new();
        graph.insert("Person", "person/P1", json!({}));
        let (pool, queue, _) = pool_with(
            &graph,
            LoaderSettings {
                high_water: 0,
                backpressure_pause: Duration::from_millis(20),
                ..settings()
            },
        );
        // -- one stale batch already above a high-water mark of zero
        queue.push(vec![crate::common::WorkItem::new("person/P0", json!({}))]);
        pool.start();

        let load = pool.load_all();
        tokio::pin!(load);
        let early = tokio::time::timeout(Duration::from_millis(150), &mut load).await;
        assert!(early.is_err(), "loaders must not fetch while the queue is above high water");
        assert_eq!(graph.fetch_calls("person/P1"), 0);

        let _ = queue.try_pop();
        let summary = load.await.expect("load resumes once the queue drains");
        assert_eq!(summary.fetched, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn the_one_where_fetch_one_leaves_the_queue_alone() {
        let graph = InMemoryMetadataSource::new();
        graph.insert("Person", "person/P1", json!({"name": "Ada"}));
        graph.fail_fetch("person/P1", 1);
        let (pool, queue, _) = pool_with(&graph, settings());
        pool.start();
        let record = pool.fetch_one("person/P1").await.expect("second try works");
        assert_eq!(record, json!({"name": "Ada"}));
        assert_eq!(queue.outstanding(), 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn the_one_where_fetch_one_retries_even_on_a_cold_pool() {
        let graph = InMemoryMetadataSource::new();
        graph.insert("Person", "person/P1", json!({"name": "Ada"}));
        graph.fail_fetch("person/P1", 2);
        let (pool, _, _) = pool_with(&graph, settings());

        // -- never started
        let record = pool.fetch_one("person/P1").await.expect("third try works");
        assert_eq!(record, json!({"name": "Ada"}));
        assert_eq!(graph.fetch_calls("person/P1"), MAX_FETCH_ATTEMPTS);

        // -- and after a stop, same deal
        graph.fail_fetch("person/P1", 2);
        pool.start();
        pool.stop().await;
        assert!(pool.fetch_one("person/P1").await.is_ok());
        assert_eq!(graph.fetch_calls("person/P1"), 2 * MAX_FETCH_ATTEMPTS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn the_one_where_leftovers_from_a_crashed_load_dont_count_next_time() {
        let graph = InMemoryMetadataSource::new();
        for i in 0..10 {
            let id = format!("person/P{i}");
            graph.insert("Person", &id, json!({"n": i}));
            graph.fail_fetch(&id, 1);
        }
        graph.insert("Place", "place/X1", json!({"name": "Ghent"}));
        graph.break_enumeration("Place");
        let (pool, queue, _) = pool_for(
            &graph,
            &["Person", "Place"],
            LoaderSettings {
                page_size: 100,
                retry_delay: Duration::from_millis(300),
                ..settings()
            },
        );
        pool.start();

        let err = pool.load_all().await.expect_err("Place enumeration is down");
        assert_eq!(err.kind(), "fetch");

        graph.heal_enumeration("Place");
        let summary = pool.load_all().await.expect("second load");
        assert_eq!(summary.enumerated, 11);
        assert_eq!(summary.fetched + summary.dropped, 11, "only this load's ids count");
        assert_eq!(summary.dropped, 0);

        let ids = drain_ids(&queue);
        assert!(ids.contains(&"place/X1".to_string()), "X1 landed before load_all returned");
        for i in 0..10 {
            assert!(ids.contains(&format!("person/P{i}")), "P{i} landed");
        }
        pool.stop().await;
    }
}
