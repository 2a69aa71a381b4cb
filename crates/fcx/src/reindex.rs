//! 🔵🟢 ReindexCoordinator: rebuild the whole index while everyone keeps searching the old one.
//!
//! 🎬 *[two indices enter. one alias leaves.]*
//!
//! ```text
//! Idle → Preparing → Rebuilding → Draining → Swapping → CleaningUp → Idle
//!            └──────────┴────────────┴──────────┴───────────┴──→ Failed
//! ```
//!
//! 1. **Preparing**: find the physical index behind the alias, create `<alias>_<unix-millis>`
//!    with the mapping. Creation failure is fatal and not retried.
//! 2. **Rebuilding**: point the index workers at the new index, run the wildcard load.
//! 3. **Draining**: poll until every queued item has been flushed.
//! 4. **Swapping**: one atomic alias call. Readers never see zero or two indices.
//! 5. **CleaningUp**: delete the old index, log what the new one holds.
//!
//! ⚠️ On failure the insert target goes back to the alias, the new index stays where it is for
//! a human to look at, and the alias keeps pointing at the original. If cleanup fails after the
//! swap, the alias is moved back so that last part stays true.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{error, info, warn};

use crate::backends::{SearchIndex, SearchIndexBackend};
use crate::errors::{IndexerError, IndexerResult};
use crate::progress::DrainProgress;
use crate::queue::WorkQueue;
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::supervisors::{EntityLoaderPool, IndexWorkerPool, LoadSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReindexState {
    Idle,
    Preparing,
    Rebuilding,
    Draining,
    Swapping,
    CleaningUp,
    Failed,
}

impl ReindexState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Preparing,
            2 => Self::Rebuilding,
            3 => Self::Draining,
            4 => Self::Swapping,
            5 => Self::CleaningUp,
            6 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// 📋 What a successful rebuild did.
#[derive(Debug, Clone)]
pub struct ReindexReport {
    pub old_index: Option<String>,
    pub new_index: String,
    /// `None` when the final count call failed. The swap already happened, so that's a warning.
    pub document_count: Option<u64>,
    pub load: LoadSummary,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ReindexSettings {
    pub alias: String,
    pub mapping: Value,
    pub drain_poll_interval: Duration,
    pub show_progress: bool,
}

/// 🕰️ `<alias>_<unix-millis>`, bumped until nothing by that name exists.
pub(crate) async fn fresh_index_name(
    index: &SearchIndexBackend,
    alias: &str,
) -> IndexerResult<String> {
    let mut millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    loop {
        let candidate = format!("{alias}_{millis}");
        if !index.exists(&candidate).await? {
            return Ok(candidate);
        }
        millis += 1;
    }
}

#[derive(Debug)]
pub struct ReindexCoordinator {
    index: Arc<SearchIndexBackend>,
    loaders: Arc<EntityLoaderPool>,
    indexers: Arc<IndexWorkerPool>,
    queue: WorkQueue,
    stats: Arc<StatsCollector>,
    settings: ReindexSettings,
    state: AtomicU8,
    // -- 🔒 held for the whole run; a second wildcard bounces off it
    running: tokio::sync::Mutex<()>,
}

impl ReindexCoordinator {
    pub fn new(
        index: Arc<SearchIndexBackend>,
        loaders: Arc<EntityLoaderPool>,
        indexers: Arc<IndexWorkerPool>,
        queue: WorkQueue,
        stats: Arc<StatsCollector>,
        settings: ReindexSettings,
    ) -> Self {
        Self {
            index,
            loaders,
            indexers,
            queue,
            stats,
            settings,
            state: AtomicU8::new(ReindexState::Idle as u8),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ReindexState {
        ReindexState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn enter(&self, state: ReindexState) {
        info!(alias = %self.settings.alias, state = ?state, "🔵🟢 reindex state");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// 🚀 Run one full blue/green rebuild. Rejected if one is already in flight.
    pub async fn reindex(&self) -> IndexerResult<ReindexReport> {
        let alias = self.settings.alias.as_str();
        let Ok(_guard) = self.running.try_lock() else {
            warn!(alias, "🚫 reindex already running, rejecting the new request");
            return Err(IndexerError::lifecycle(
                "reindex",
                alias,
                "a reindex is already running",
            ));
        };

        let started = Instant::now();
        self.stats.begin_run();
        match self.run(started).await {
            Ok(report) => {
                self.enter(ReindexState::Idle);
                Ok(report)
            }
            Err(err) => {
                self.indexers.target().set(alias);
                self.enter(ReindexState::Failed);
                error!(alias, kind = err.kind(), "💀 reindex failed: {err}");
                Err(err)
            }
        }
    }

    async fn run(&self, started: Instant) -> IndexerResult<ReindexReport> {
        let alias = self.settings.alias.as_str();

        // -- 🏗️ preparing
        self.enter(ReindexState::Preparing);
        let old_index = self.index.alias_index_for(alias).await?;
        let new_index = fresh_index_name(&self.index, alias).await?;
        self.index
            .create(&new_index, Some(&self.settings.mapping))
            .await?;
        info!(alias, old = ?old_index, new = %new_index, "🏗️ created fresh index");

        // -- 📡 rebuilding
        self.enter(ReindexState::Rebuilding);
        self.indexers.target().set(new_index.as_str());
        let load = self.loaders.load_all().await?;

        // -- ⏳ draining
        self.enter(ReindexState::Draining);
        self.drain(&new_index).await?;

        // -- 🔀 swapping
        self.enter(ReindexState::Swapping);
        match &old_index {
            Some(old) => self.index.alias_replace(alias, old, &new_index).await?,
            None => self.index.alias_add(alias, &new_index).await?,
        }
        self.indexers.target().set(alias);
        info!(alias, new = %new_index, "🔀 alias swapped");

        // -- 🧹 cleaning up
        self.enter(ReindexState::CleaningUp);
        if let Some(old) = &old_index {
            if let Err(err) = self.index.delete(old).await {
                self.restore_alias(old, &new_index).await;
                return Err(err);
            }
            info!(alias, old = %old, "🗑️ old index deleted");
        }
        let document_count = match self.index.count(&new_index).await {
            Ok(count) => {
                info!(index = %new_index, count, "📊 {new_index} contains {count} records");
                Some(count)
            }
            Err(err) => {
                warn!(index = %new_index, "⚠️ could not count the new index: {err}");
                None
            }
        };

        Ok(ReindexReport {
            old_index,
            new_index,
            document_count,
            load,
            stats: self.stats.snapshot(),
            elapsed: started.elapsed(),
        })
    }

    /// ⏳ Wait until everything pushed has been flushed. A backlog nobody is working on is fatal.
    async fn drain(&self, new_index: &str) -> IndexerResult<()> {
        let mut progress = DrainProgress::new(new_index, self.settings.show_progress);
        loop {
            let outstanding = self.queue.outstanding();
            if outstanding == 0 {
                break;
            }
            let live = self.indexers.alive_workers();
            if live == 0 {
                progress.finish();
                return Err(IndexerError::lifecycle(
                    "drain",
                    new_index,
                    format!("{outstanding} items outstanding and no live index workers"),
                ));
            }
            info!(
                index = new_index,
                backlog = self.queue.size(),
                outstanding,
                live_workers = live,
                "⏳ draining"
            );
            progress.update(self.queue.size(), self.stats.snapshot().total_loaded(), live);
            tokio::time::sleep(self.settings.drain_poll_interval).await;
        }
        progress.finish();
        Ok(())
    }

    async fn restore_alias(&self, old: &str, new_index: &str) {
        let alias = self.settings.alias.as_str();
        match self.index.alias_replace(alias, new_index, old).await {
            Ok(()) => warn!(alias, old, "↩️ cleanup failed, alias moved back to the original"),
            Err(err) => error!(
                alias,
                old,
                new = new_index,
                "💀 cleanup failed and the alias could not be moved back: {err}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryIndex, InMemoryMetadataSource, MetadataSourceBackend};
    use crate::batching::BatchingConfig;
    use crate::indexer::BatchIndexer;
    use crate::registry::{EntityConfig, EntityRegistry};
    use crate::stats::StatsMode;
    use crate::supervisors::{ActiveTarget, IndexerSettings, LoaderSettings};
    use crate::transforms::EnvelopeRules;
    use serde_json::json;

    struct Rig {
        coordinator: ReindexCoordinator,
        graph: InMemoryMetadataSource,
        mem: InMemoryIndex,
        loaders: Arc<EntityLoaderPool>,
        indexers: Arc<IndexWorkerPool>,
    }

    fn rig() -> Rig {
        let graph = InMemoryMetadataSource::new();
        for id in ["P1", "P2", "P3"] {
            graph.insert("Person", &format!("person/{id}"), json!({ "name": id }));
        }
        let mem = InMemoryIndex::new();
        mem.seed("fiches", "fiches_1", &["person/OLD"]);

        let registry = Arc::new(
            EntityRegistry::new(
                &[EntityConfig {
                    name: "Person".into(),
                    rule_set: None,
                    path_segment: None,
                }],
                "generic",
            )
            .expect("registry"),
        );
        let queue = WorkQueue::new();
        let stats = Arc::new(StatsCollector::new(StatsMode::ResetPerRun));
        let index = Arc::new(SearchIndexBackend::InMemory(mem.clone()));

        let loaders = Arc::new(EntityLoaderPool::new(
            Arc::new(MetadataSourceBackend::InMemory(graph.clone())),
            Arc::clone(&registry),
            queue.clone(),
            Arc::clone(&stats),
            LoaderSettings {
                workers: 2,
                retry_delay: Duration::from_millis(5),
                poll_interval: Duration::from_millis(10),
                shutdown_timeout: Duration::from_secs(1),
                ..LoaderSettings::default()
            },
        ));
        let indexers = Arc::new(IndexWorkerPool::new(
            queue.clone(),
            BatchIndexer::new(
                Arc::clone(&index),
                Arc::new(EnvelopeRules::default()),
                registry,
                Arc::clone(&stats),
                "fiche.data._id",
            ),
            ActiveTarget::new("fiches"),
            IndexerSettings {
                workers: 2,
                shutdown_timeout: Duration::from_secs(1),
                batching: BatchingConfig {
                    min_batch_size: 1,
                    save_interval_ms: 0,
                    idle_sleep_ms: 5,
                    ..BatchingConfig::default()
                },
            },
        ));
        loaders.start();
        indexers.start();

        let coordinator = ReindexCoordinator::new(
            index,
            Arc::clone(&loaders),
            Arc::clone(&indexers),
            queue,
            stats,
            ReindexSettings {
                alias: "fiches".into(),
                mapping: json!({ "mappings": {} }),
                drain_poll_interval: Duration::from_millis(10),
                show_progress: false,
            },
        );
        Rig {
            coordinator,
            graph,
            mem,
            loaders,
            indexers,
        }
    }

    impl Rig {
        async fn shutdown(&self) {
            self.loaders.stop().await;
            self.indexers.stop().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_green_replaces_blue_and_blue_is_recycled() {
        let rig = rig();
        let report = rig.coordinator.reindex().await.expect("reindex");
        rig.shutdown().await;

        assert_eq!(report.old_index.as_deref(), Some("fiches_1"));
        assert_eq!(rig.mem.alias_targets("fiches"), vec![report.new_index.clone()]);
        assert!(!rig.mem.index_names().contains(&"fiches_1".to_string()));
        assert_eq!(report.document_count, Some(3));
        assert_eq!(report.load.fetched, 3);
        assert_eq!(report.stats.load.get("person"), Some(&3));
        assert_eq!(rig.coordinator.state(), ReindexState::Idle);
        assert_eq!(rig.indexers.target().get(), "fiches");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_the_swap_fails_and_blue_keeps_serving() {
        let rig = rig();
        rig.mem.fail_alias_replace(true);

        let err = rig.coordinator.reindex().await.expect_err("swap must fail");
        rig.shutdown().await;

        assert_eq!(err.kind(), "index_lifecycle");
        assert_eq!(rig.mem.alias_targets("fiches"), vec!["fiches_1".to_string()]);
        assert_eq!(rig.mem.index_names().len(), 2, "the new index is left for inspection");
        assert_eq!(rig.coordinator.state(), ReindexState::Failed);
        assert_eq!(rig.indexers.target().get(), "fiches");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_cleanup_fails_and_the_alias_walks_back() {
        let rig = rig();
        rig.mem.fail_delete(true);

        let err = rig.coordinator.reindex().await.expect_err("delete must fail");
        rig.shutdown().await;

        assert_eq!(err.kind(), "index_lifecycle");
        assert_eq!(rig.mem.alias_targets("fiches"), vec!["fiches_1".to_string()]);
        assert_eq!(rig.mem.document_ids("fiches"), vec!["person/OLD".to_string()]);
        assert_eq!(rig.coordinator.state(), ReindexState::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_create_fails_and_nothing_gets_loaded() {
        let rig = rig();
        rig.mem.fail_create(true);

        let err = rig.coordinator.reindex().await.expect_err("create must fail");
        rig.shutdown().await;

        assert_eq!(err.kind(), "index_lifecycle");
        assert_eq!(rig.graph.fetch_calls("person/P1"), 0);
        assert_eq!(rig.mem.index_names(), vec!["fiches_1".to_string()]);
        assert_eq!(rig.coordinator.state(), ReindexState::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_a_broken_enumeration_never_gets_swapped_in() {
        let rig = rig();
        rig.graph.break_enumeration("Person");

        let err = rig.coordinator.reindex().await.expect_err("load must fail");
        rig.shutdown().await;

        assert_eq!(err.kind(), "fetch");
        assert_eq!(rig.mem.alias_targets("fiches"), vec!["fiches_1".to_string()]);
        assert_eq!(rig.indexers.target().get(), "fiches");
    }

    // -- single-threaded on purpose: the first run must yield while holding the lock
    #[tokio::test]
    async fn the_one_where_two_wildcards_arrive_and_one_is_turned_away() {
        let rig = rig();
        let (first, second) = tokio::join!(rig.coordinator.reindex(), rig.coordinator.reindex());
        rig.shutdown().await;

        assert!(first.is_ok());
        let err = second.expect_err("second run must bounce");
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_there_was_no_blue_to_begin_with() {
        let rig = rig();
        // -- throw away the seeded index so the alias is unbound
        rig.mem.delete("fiches_1").await.expect("delete");

        let report = rig.coordinator.reindex().await.expect("reindex");
        rig.shutdown().await;

        assert_eq!(report.old_index, None);
        assert_eq!(rig.mem.alias_targets("fiches"), vec![report.new_index]);
    }
}
