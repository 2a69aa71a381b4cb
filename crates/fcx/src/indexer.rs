//! 🚰 BatchIndexer: transform a batch, bulk insert it, and check the receipt.
//!
//! The index happily answers 200 while quietly dropping documents on the floor, so a bulk call
//! is only trusted after every id we sent has been found among the ids it says it wrote.
//! Anything not on that list is named in an `IndexWrite` error, counted against its entity type,
//! and not retried here. The next reindex is the retry.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backends::{BulkResult, SearchIndex, SearchIndexBackend};
use crate::common::{IndexDocument, WorkItem, entity_key};
use crate::errors::{IndexerError, IndexerResult};
use crate::registry::EntityRegistry;
use crate::stats::StatsCollector;
use crate::transforms::RuleEngine;

#[derive(Debug, Clone)]
pub struct BatchIndexer {
    index: Arc<SearchIndexBackend>,
    rules: Arc<dyn RuleEngine>,
    registry: Arc<EntityRegistry>,
    stats: Arc<StatsCollector>,
    id_field_path: String,
}

impl BatchIndexer {
    pub fn new(
        index: Arc<SearchIndexBackend>,
        rules: Arc<dyn RuleEngine>,
        registry: Arc<EntityRegistry>,
        stats: Arc<StatsCollector>,
        id_field_path: impl Into<String>,
    ) -> Self {
        Self {
            index,
            rules,
            registry,
            stats,
            id_field_path: id_field_path.into(),
        }
    }

    /// 🚀 Transform and insert `items` into `target`. Returns how many documents landed.
    ///
    /// The rule set is picked once, from the first item's type segment: batches are expected
    /// to be homogeneous, and a stray item rides along under its neighbour's rules.
    pub async fn index(&self, items: Vec<WorkItem>, target: &str) -> IndexerResult<usize> {
        let Some(first) = items.first() else {
            return Ok(0);
        };
        let rule_set = self.registry.rule_set_for(first.entity_segment());

        let documents = match self.transform_all(&items, &rule_set) {
            Ok(documents) => documents,
            Err(err) => {
                self.count_failed(items.iter().map(|item| item.id.as_str()));
                return Err(err);
            }
        };
        if documents.is_empty() {
            debug!(rule_set = %rule_set, items = items.len(), "🫥 rule set produced nothing, batch discarded");
            return Ok(0);
        }

        let result = match self.index.bulk_insert(target, &documents).await {
            Ok(result) => result,
            Err(err) => {
                self.count_failed(documents.iter().map(|doc| doc.source_id.as_str()));
                return Err(err);
            }
        };

        // -- 🧾 reconcile: what we sent vs what the index swears it wrote
        let written = result.written_ids();
        let mut failed_ids = Vec::new();
        let mut seen_failed = HashSet::new();
        let mut outcomes: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for doc in &documents {
            let entry = outcomes.entry(entity_key(&doc.source_id)).or_default();
            if written.contains(doc.id.as_str()) {
                entry.0 += 1;
            } else {
                entry.1 += 1;
                if seen_failed.insert(doc.id.as_str()) {
                    failed_ids.push(doc.id.clone());
                }
            }
        }
        self.stats.record_many(
            outcomes
                .iter()
                .map(|(entity, (loaded, failed))| (entity.as_str(), *loaded, *failed)),
        );

        if failed_ids.is_empty() {
            debug!(index = target, documents = documents.len(), "✅ bulk verified");
            return Ok(documents.len());
        }

        let reason = describe_failures(&seen_failed, &result);
        warn!(index = target, failed = failed_ids.len(), sent = documents.len(), "💀 partial bulk write");
        Err(IndexerError::index_write(target, failed_ids, reason))
    }

    fn transform_all(
        &self,
        items: &[WorkItem],
        rule_set: &crate::registry::RuleSet,
    ) -> IndexerResult<Vec<IndexDocument>> {
        let mut documents = Vec::with_capacity(items.len());
        for item in items {
            let Some(body) = self.rules.apply(rule_set, &item.id, &item.record)? else {
                debug!(id = %item.id, rule_set = %rule_set, "🫥 nothing to index");
                continue;
            };
            documents.push(IndexDocument::new(
                body,
                &self.id_field_path,
                &item.id,
                rule_set.name(),
            )?);
        }
        Ok(documents)
    }

    fn count_failed<'a>(&self, ids: impl Iterator<Item = &'a str>) {
        let mut per_entity: BTreeMap<String, u64> = BTreeMap::new();
        for id in ids {
            *per_entity.entry(entity_key(id)).or_default() += 1;
        }
        self.stats
            .record_many(per_entity.iter().map(|(entity, n)| (entity.as_str(), 0, *n)));
    }
}

/// 🧾 Split our failed ids into "rejected with a reason" and "never mentioned at all".
/// Failures the index reports for ids outside `failed` are none of our business.
fn describe_failures(failed: &HashSet<&str>, result: &BulkResult) -> String {
    let mut rejected_ids = HashSet::new();
    let rejected: Vec<String> = result
        .failures()
        .filter(|f| failed.contains(f.id.as_str()) && rejected_ids.insert(f.id.as_str()))
        .map(|f| format!("{} ({}: {})", f.id, f.status, f.error.as_deref().unwrap_or("no reason")))
        .collect();
    let missing = failed.len() - rejected_ids.len();
    let shown = &rejected[..rejected.len().min(3)];
    if shown.is_empty() {
        format!("{missing} document(s) missing from the bulk response")
    } else {
        format!(
            "{missing} document(s) missing from the bulk response, rejected: {}",
            shown.join("; ")
        )
    }
}
