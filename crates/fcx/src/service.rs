//! 🎛️ IndexerService: the switchboard.
//!
//! Builds every component from an [`AppConfig`], makes sure the alias points at *something*,
//! starts both pools, and routes triggers:
//! - `*` → a full blue/green [`ReindexCoordinator`] run;
//! - anything else → fetch that one record and write it straight through the alias.
//!
//! 🦆 The duck has no role here. It just likes switchboards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::Value;
use tracing::{info, warn};

use crate::app_config::AppConfig;
use crate::backends::{
    ElasticsearchIndex, HttpMetadataSource, MetadataSourceBackend, SearchIndex, SearchIndexBackend,
};
use crate::common::{WorkItem, entity_key, entity_segment};
use crate::errors::IndexerResult;
use crate::indexer::BatchIndexer;
use crate::queue::WorkQueue;
use crate::registry::EntityRegistry;
use crate::reindex::{ReindexCoordinator, ReindexReport, ReindexSettings, ReindexState, fresh_index_name};
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::supervisors::{ActiveTarget, EntityLoaderPool, IndexWorkerPool};
use crate::transforms::{EnvelopeRules, RuleEngine};

/// 🎯 What a trigger message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Everything,
    Entity(String),
}

impl Trigger {
    /// 🧽 Strip whitespace and surrounding quotes. Blank means "nothing to do".
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        match cleaned {
            "" => None,
            "*" => Some(Trigger::Everything),
            id => Some(Trigger::Entity(id.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Reindexed(ReindexReport),
    Indexed { id: String, landed: usize },
    Skipped { id: String, reason: String },
}

#[derive(Debug)]
pub struct IndexerService {
    alias: String,
    mapping: Value,
    index: Arc<SearchIndexBackend>,
    registry: Arc<EntityRegistry>,
    queue: WorkQueue,
    stats: Arc<StatsCollector>,
    loaders: Arc<EntityLoaderPool>,
    indexers: Arc<IndexWorkerPool>,
    indexer: BatchIndexer,
    coordinator: ReindexCoordinator,
    shutdown_timeout: Duration,
}

impl IndexerService {
    /// 🏗️ Real backends: HTTP metadata graph, Elasticsearch, envelope rules, mapping from disk.
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let mapping_path = config.mapping_file().context(
            "💀 search.mapping_file is not set. A fresh index can't be created without a mapping.",
        )?;
        let raw = tokio::fs::read_to_string(mapping_path)
            .await
            .with_context(|| format!("💀 Failed to read mapping file '{}'", mapping_path.display()))?;
        let mapping: Value = serde_json::from_str(&raw).with_context(|| {
            format!("💀 Mapping file '{}' is not valid JSON", mapping_path.display())
        })?;

        let source = MetadataSourceBackend::Http(
            HttpMetadataSource::new(config.metadata.clone())
                .context("💀 Failed to build the metadata client")?,
        );
        let index = SearchIndexBackend::Elasticsearch(
            ElasticsearchIndex::new(config.search.clone())
                .context("💀 Failed to build the search index client")?,
        );
        let rules = Arc::new(EnvelopeRules::new(&config.rules));
        Self::with_backends(config, source, index, rules, mapping)
            .context("💀 Failed to wire up the indexer service")
    }

    /// 🔌 Same wiring, any backends. Tests and dry runs plug the in-memory ones in here.
    pub fn with_backends(
        config: &AppConfig,
        source: MetadataSourceBackend,
        index: SearchIndexBackend,
        rules: Arc<dyn RuleEngine>,
        mapping: Value,
    ) -> IndexerResult<Self> {
        config.validate()?;
        let alias = config.search.alias.clone();
        let registry = Arc::new(EntityRegistry::new(
            &config.entities,
            &config.rules.generic_rule_set,
        )?);
        let queue = WorkQueue::new();
        let stats = Arc::new(StatsCollector::new(config.runtime.stats_mode));
        let index = Arc::new(index);

        let loaders = Arc::new(EntityLoaderPool::new(
            Arc::new(source),
            Arc::clone(&registry),
            queue.clone(),
            Arc::clone(&stats),
            config.loader_settings(),
        ));
        let indexer = BatchIndexer::new(
            Arc::clone(&index),
            rules,
            Arc::clone(&registry),
            Arc::clone(&stats),
            config.search.id_field_path.clone(),
        );
        let indexers = Arc::new(IndexWorkerPool::new(
            queue.clone(),
            indexer.clone(),
            ActiveTarget::new(alias.clone()),
            config.indexer_settings(),
        ));
        let coordinator = ReindexCoordinator::new(
            Arc::clone(&index),
            Arc::clone(&loaders),
            Arc::clone(&indexers),
            queue.clone(),
            Arc::clone(&stats),
            ReindexSettings {
                alias: alias.clone(),
                mapping: mapping.clone(),
                drain_poll_interval: config.runtime.drain_poll_interval(),
                show_progress: config.runtime.show_progress,
            },
        );

        Ok(Self {
            alias,
            mapping,
            index,
            registry,
            queue,
            stats,
            loaders,
            indexers,
            indexer,
            coordinator,
            shutdown_timeout: config.runtime.shutdown_timeout(),
        })
    }

    /// 🚀 Bind the alias if it's dangling, then start both pools.
    pub async fn start(&self) -> IndexerResult<()> {
        self.bootstrap_alias().await?;
        self.loaders.start();
        self.indexers.start();
        info!(alias = %self.alias, "🚀 indexer service started");
        Ok(())
    }

    async fn bootstrap_alias(&self) -> IndexerResult<()> {
        if let Some(current) = self.index.alias_index_for(&self.alias).await? {
            info!(alias = %self.alias, index = %current, "🏷️ alias already bound");
            return Ok(());
        }
        let name = fresh_index_name(&self.index, &self.alias).await?;
        self.index.create(&name, Some(&self.mapping)).await?;
        self.index.alias_add(&self.alias, &name).await?;
        info!(alias = %self.alias, index = %name, "🌱 alias was dangling, bound it to a fresh index");
        Ok(())
    }

    /// 📬 One trigger in, one outcome out. Errors are already counted in the stats.
    pub async fn handle(&self, trigger: Trigger) -> IndexerResult<TriggerOutcome> {
        let outcome = match trigger {
            Trigger::Everything => {
                let report = self.coordinator.reindex().await?;
                info!(
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    stats = %report.stats.to_json(),
                    "🏁 full reindex complete"
                );
                TriggerOutcome::Reindexed(report)
            }
            Trigger::Entity(id) => self.index_one(id).await?,
        };
        self.log_count().await;
        Ok(outcome)
    }

    async fn index_one(&self, id: String) -> IndexerResult<TriggerOutcome> {
        let segment = entity_segment(&id).unwrap_or_default();
        if self.registry.lookup(segment).is_none() {
            let reason = format!("not indexing entity of type '{segment}'");
            info!(id = %id, "🙅 {reason}");
            return Ok(TriggerOutcome::Skipped { id, reason });
        }

        let started = Instant::now();
        let record = match self.loaders.fetch_one(&id).await {
            Ok(record) => record,
            Err(err) => {
                self.stats.record_error(&entity_key(&id), 1);
                return Err(err);
            }
        };
        let landed = self
            .indexer
            .index(vec![WorkItem::new(id.clone(), record)], &self.alias)
            .await?;
        info!(
            id = %id,
            landed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "🎯 single record indexed"
        );
        Ok(TriggerOutcome::Indexed { id, landed })
    }

    async fn log_count(&self) {
        match self.index.count(&self.alias).await {
            Ok(count) => info!(alias = %self.alias, count, "📊 {} contains {count} records", self.alias),
            Err(err) => warn!(alias = %self.alias, "⚠️ could not count documents: {err}"),
        }
    }

    /// 🛑 Stop feeding, give the indexers a bounded window to drain, then stop them.
    /// Returns the names of workers that had to be aborted or exited badly.
    pub async fn shutdown(&self) -> Vec<String> {
        let mut unclean = self.loaders.stop().await;

        let deadline = Instant::now() + self.shutdown_timeout;
        while self.queue.outstanding() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.queue.outstanding() > 0 {
            warn!(
                outstanding = self.queue.outstanding(),
                "⚠️ shutting down with work still queued"
            );
        }

        unclean.extend(self.indexers.stop().await);
        info!(unclean = unclean.len(), "🛑 indexer service stopped");
        unclean
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reindex_state(&self) -> ReindexState {
        self.coordinator.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryIndex, InMemoryMetadataSource};
    use figment::{
        Figment,
        providers::{Format, Toml},
    };
    use serde_json::json;

    fn test_config() -> AppConfig {
        Figment::from(Toml::string(
            r#"
            [metadata]
            url = "http://graph.local/api"

            [search]
            url = "http://localhost:9200"
            alias = "fiches"

            [[entities]]
            name = "Person"

            [runtime]
            loader_workers = 2
            indexer_workers = 2
            retry_delay_ms = 5
            drain_poll_interval_ms = 10
            shutdown_timeout_secs = 2
            show_progress = false

            [batching]
            min_batch_size = 1
            save_interval_ms = 0
            idle_sleep_ms = 5
            "#,
        ))
        .extract()
        .expect("💀 test config should parse")
    }

    fn service(graph: &InMemoryMetadataSource, mem: &InMemoryIndex) -> IndexerService {
        IndexerService::with_backends(
            &test_config(),
            MetadataSourceBackend::InMemory(graph.clone()),
            SearchIndexBackend::InMemory(mem.clone()),
            Arc::new(EnvelopeRules::default()),
            json!({ "mappings": {} }),
        )
        .expect("💀 service should wire up")
    }

    fn people(graph: &InMemoryMetadataSource) {
        for id in ["P1", "P2", "P3"] {
            graph.insert("Person", &format!("person/{id}"), json!({ "name": id }));
        }
    }

    #[test]
    fn the_one_where_triggers_get_a_bath() {
        assert_eq!(Trigger::parse("  \"*\"  "), Some(Trigger::Everything));
        assert_eq!(
            Trigger::parse("'person/P1'\n"),
            Some(Trigger::Entity("person/P1".into()))
        );
        assert_eq!(Trigger::parse("   "), None);
        assert_eq!(Trigger::parse("\"\""), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn the_one_where_a_dangling_alias_gets_a_home() {
        let (graph, mem) = (InMemoryMetadataSource::new(), InMemoryIndex::new());
        let service = service(&graph, &mem);
        service.start().await.expect("start");
        service.shutdown().await;

        let targets = mem.alias_targets("fiches");
        assert_eq!(targets.len(), 1);
        assert!(targets[0].starts_with("fiches_"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn the_one_where_a_bound_alias_is_left_alone() {
        let (graph, mem) = (InMemoryMetadataSource::new(), InMemoryIndex::new());
        mem.seed("fiches", "fiches_1", &[]);
        let service = service(&graph, &mem);
        service.start().await.expect("start");
        service.shutdown().await;

        assert_eq!(mem.index_names(), vec!["fiches_1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn the_one_where_one_person_goes_straight_into_the_live_index() {
        let (graph, mem) = (InMemoryMetadataSource::new(), InMemoryIndex::new());
        people(&graph);
        mem.seed("fiches", "fiches_1", &[]);
        let service = service(&graph, &mem);
        service.start().await.expect("start");

        let outcome = service
            .handle(Trigger::Entity("person/P2".into()))
            .await
            .expect("single id");
        service.shutdown().await;

        assert!(matches!(outcome, TriggerOutcome::Indexed { landed: 1, .. }));
        assert_eq!(mem.document_ids("fiches"), vec!["person/P2".to_string()]);
        assert_eq!(service.stats().load.get("person"), Some(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn the_one_where_a_place_is_not_a_person() {
        let (graph, mem) = (InMemoryMetadataSource::new(), InMemoryIndex::new());
        graph.insert("Place", "place/X1", json!({ "name": "Ghent" }));
        mem.seed("fiches", "fiches_1", &[]);
        let service = service(&graph, &mem);
        service.start().await.expect("start");

        let outcome = service
            .handle(Trigger::Entity("place/X1".into()))
            .await
            .expect("skip is not an error");
        service.shutdown().await;

        assert!(matches!(outcome, TriggerOutcome::Skipped { .. }));
        assert_eq!(graph.fetch_calls("place/X1"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn the_one_where_a_single_fetch_strikes_out_and_gets_counted() {
        let (graph, mem) = (InMemoryMetadataSource::new(), InMemoryIndex::new());
        people(&graph);
        graph.fail_fetch("person/P1", 3);
        mem.seed("fiches", "fiches_1", &[]);
        let service = service(&graph, &mem);
        service.start().await.expect("start");

        let err = service
            .handle(Trigger::Entity("person/P1".into()))
            .await
            .expect_err("three strikes");
        service.shutdown().await;

        assert_eq!(err.kind(), "fetch");
        assert_eq!(graph.fetch_calls("person/P1"), 3);
        assert_eq!(service.stats().error.get("person"), Some(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_the_wildcard_rebuilds_everything() {
        let (graph, mem) = (InMemoryMetadataSource::new(), InMemoryIndex::new());
        people(&graph);
        mem.seed("fiches", "fiches_1", &["person/OLD"]);
        let service = service(&graph, &mem);
        service.start().await.expect("start");

        let outcome = service.handle(Trigger::Everything).await.expect("reindex");
        service.shutdown().await;

        let TriggerOutcome::Reindexed(report) = outcome else {
            panic!("💀 wildcard should reindex, got {outcome:?}");
        };
        assert_eq!(mem.alias_targets("fiches"), vec![report.new_index]);
        assert_eq!(mem.document_ids("fiches").len(), 3);
        assert_eq!(
            service.stats().to_json(),
            json!({ "load": { "person": 3 }, "error": {} })
        );
        assert_eq!(service.reindex_state(), ReindexState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn the_one_where_a_botched_rebuild_is_followed_by_two_good_ones() {
        let (graph, mem) = (InMemoryMetadataSource::new(), InMemoryIndex::new());
        people(&graph);
        mem.seed("fiches", "fiches_1", &["person/OLD"]);
        graph.break_enumeration("Person");
        let service = service(&graph, &mem);
        service.start().await.expect("start");

        let err = service
            .handle(Trigger::Everything)
            .await
            .expect_err("enumeration is down");
        assert_eq!(err.kind(), "fetch");
        assert_eq!(service.reindex_state(), ReindexState::Failed);
        assert_eq!(mem.alias_targets("fiches"), vec!["fiches_1".to_string()]);

        graph.heal_enumeration("Person");
        let mut previous = "fiches_1".to_string();
        for round in 0..2 {
            let outcome = service.handle(Trigger::Everything).await.expect("reindex");
            let TriggerOutcome::Reindexed(report) = outcome else {
                panic!("💀 wildcard should reindex, got {outcome:?}");
            };
            assert_eq!(report.old_index.as_deref(), Some(previous.as_str()), "round {round}");
            assert_eq!(mem.alias_targets("fiches"), vec![report.new_index.clone()]);
            assert_eq!(report.load.enumerated, 3);
            assert_eq!(report.document_count, Some(3));
            assert_eq!(mem.document_ids("fiches").len(), 3);
            assert!(!mem.index_names().contains(&previous), "{previous} was cleaned up");
            assert_eq!(service.reindex_state(), ReindexState::Idle);
            previous = report.new_index;
        }
        service.shutdown().await;
    }
}
