//! 🧠 In-memory backends: a metadata graph and a search index that live entirely in RAM.
//!
//! For tests and local dry runs. Both are cheap `Clone` handles over shared state, so a test
//! can keep one copy, hand the other to the pipeline, and inspect what happened afterwards.
//!
//! They also misbehave on request: fetches that fail the first N times, enumeration pages
//! that never load, alias swaps and deletes that blow up, bulk responses that "forget"
//! documents. Everything the real services do at 3am, on demand, at 3pm. 🦆

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::backends::{BulkItemOutcome, BulkResult, MetadataSource, SearchIndex};
use crate::common::IndexDocument;
use crate::errors::{IndexerError, IndexerResult};
use crate::registry::EntityDescriptor;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ===== metadata source =====

#[derive(Debug, Default)]
struct GraphState {
    /// 📇 entity name → ids, in enumeration order
    ids_by_type: BTreeMap<String, Vec<String>>,
    records: HashMap<String, Value>,
    /// 💥 id → how many more fetches should fail
    fail_next: HashMap<String, u32>,
    fetch_calls: HashMap<String, u32>,
    broken_enumeration: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryMetadataSource {
    state: Arc<Mutex<GraphState>>,
}

impl InMemoryMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📥 Register a record under an entity type. Enumeration returns ids in insertion order.
    pub fn insert(&self, entity: &str, id: &str, record: Value) {
        let mut state = lock(&self.state);
        state
            .ids_by_type
            .entry(entity.to_string())
            .or_default()
            .push(id.to_string());
        state.records.insert(id.to_string(), record);
    }

    /// 💥 The next `times` fetches of `id` fail with a `Fetch` error.
    pub fn fail_fetch(&self, id: &str, times: u32) {
        lock(&self.state).fail_next.insert(id.to_string(), times);
    }

    /// 💥 Every enumeration page for `entity` fails.
    pub fn break_enumeration(&self, entity: &str) {
        lock(&self.state)
            .broken_enumeration
            .insert(entity.to_string());
    }

    /// 🩹 Undo [`Self::break_enumeration`].
    pub fn heal_enumeration(&self, entity: &str) {
        lock(&self.state).broken_enumeration.remove(entity);
    }

    pub fn fetch_calls(&self, id: &str) -> u32 {
        lock(&self.state).fetch_calls.get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl MetadataSource for InMemoryMetadataSource {
    async fn enumerate(
        &self,
        entity: &EntityDescriptor,
        offset: usize,
        limit: usize,
    ) -> IndexerResult<Vec<String>> {
        let state = lock(&self.state);
        if state.broken_enumeration.contains(&entity.name) {
            return Err(IndexerError::fetch(
                format!("{}[{offset}..+{limit}]", entity.name),
                "enumeration endpoint is down (injected)",
            ));
        }
        Ok(state
            .ids_by_type
            .get(&entity.name)
            .map(|ids| ids.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch(&self, id: &str) -> IndexerResult<Value> {
        let mut state = lock(&self.state);
        *state.fetch_calls.entry(id.to_string()).or_default() += 1;
        if let Some(remaining) = state.fail_next.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IndexerError::fetch(id, "metadata source hiccup (injected)"));
            }
        }
        match state.records.get(id) {
            Some(Value::Null) | None => Err(IndexerError::fetch(id, "no such record")),
            Some(record) => Ok(record.clone()),
        }
    }
}

// ===== search index =====

#[derive(Debug, Default)]
struct IndexState {
    /// 🗄️ physical index → (doc id → document)
    indices: BTreeMap<String, BTreeMap<String, Value>>,
    mappings: BTreeMap<String, Value>,
    aliases: BTreeMap<String, BTreeSet<String>>,
    /// 📜 (index, ids) per bulk call, in call order
    bulk_log: Vec<(String, Vec<String>)>,
    fail_create: bool,
    fail_delete: bool,
    fail_alias_replace: bool,
    fail_bulk: bool,
    /// 🙈 how many trailing items each bulk response silently leaves out
    forget_last_items: usize,
    rejected_ids: HashSet<String>,
}

impl IndexState {
    /// 🏷️ Writes and counts through an alias land on its single index, like Elasticsearch does.
    fn resolve(&self, name: &str) -> Option<String> {
        if self.indices.contains_key(name) {
            return Some(name.to_string());
        }
        match self.aliases.get(name) {
            Some(targets) if targets.len() == 1 => targets.iter().next().cloned(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    state: Arc<Mutex<IndexState>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🏗️ Seed a physical index and bind the alias to it, as if a previous run had happened.
    pub fn seed(&self, alias: &str, index: &str, ids: &[&str]) {
        let mut state = lock(&self.state);
        let docs = ids
            .iter()
            .map(|id| (id.to_string(), Value::Null))
            .collect();
        state.indices.insert(index.to_string(), docs);
        state
            .aliases
            .entry(alias.to_string())
            .or_default()
            .insert(index.to_string());
    }

    pub fn fail_create(&self, fail: bool) {
        lock(&self.state).fail_create = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        lock(&self.state).fail_delete = fail;
    }

    pub fn fail_alias_replace(&self, fail: bool) {
        lock(&self.state).fail_alias_replace = fail;
    }

    pub fn fail_bulk(&self, fail: bool) {
        lock(&self.state).fail_bulk = fail;
    }

    pub fn forget_last_items(&self, n: usize) {
        lock(&self.state).forget_last_items = n;
    }

    pub fn reject_id(&self, id: &str) {
        lock(&self.state).rejected_ids.insert(id.to_string());
    }

    pub fn index_names(&self) -> Vec<String> {
        lock(&self.state).indices.keys().cloned().collect()
    }

    pub fn alias_targets(&self, alias: &str) -> Vec<String> {
        lock(&self.state)
            .aliases
            .get(alias)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document_ids(&self, index: &str) -> Vec<String> {
        let state = lock(&self.state);
        state
            .resolve(index)
            .and_then(|physical| state.indices.get(&physical))
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        let state = lock(&self.state);
        let physical = state.resolve(index)?;
        state.indices.get(&physical)?.get(id).cloned()
    }

    pub fn bulk_log(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.state).bulk_log.clone()
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn exists(&self, name: &str) -> IndexerResult<bool> {
        Ok(lock(&self.state).indices.contains_key(name))
    }

    async fn create(&self, name: &str, mapping: Option<&Value>) -> IndexerResult<()> {
        let mut state = lock(&self.state);
        if state.fail_create {
            return Err(IndexerError::lifecycle("create", name, "cluster said no (injected)"));
        }
        let Some(mapping) = mapping else {
            return Err(IndexerError::lifecycle("create", name, "no mapping supplied"));
        };
        if state.indices.contains_key(name) {
            return Err(IndexerError::lifecycle("create", name, "index already exists"));
        }
        state.indices.insert(name.to_string(), BTreeMap::new());
        state.mappings.insert(name.to_string(), mapping.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> IndexerResult<()> {
        let mut state = lock(&self.state);
        if state.fail_delete {
            return Err(IndexerError::lifecycle("delete", name, "cluster said no (injected)"));
        }
        if state.indices.remove(name).is_none() {
            return Err(IndexerError::lifecycle("delete", name, "index does not exist"));
        }
        state.mappings.remove(name);
        for targets in state.aliases.values_mut() {
            targets.remove(name);
        }
        state.aliases.retain(|_, targets| !targets.is_empty());
        Ok(())
    }

    async fn count(&self, name: &str) -> IndexerResult<u64> {
        let state = lock(&self.state);
        state
            .resolve(name)
            .and_then(|physical| state.indices.get(&physical))
            .map(|docs| docs.len() as u64)
            .ok_or_else(|| IndexerError::lifecycle("count", name, "index does not exist"))
    }

    async fn bulk_insert(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> IndexerResult<BulkResult> {
        let mut state = lock(&self.state);
        let ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        if state.fail_bulk {
            return Err(IndexerError::index_write(index, ids, "bulk endpoint down (injected)"));
        }
        let Some(physical) = state.resolve(index) else {
            return Err(IndexerError::index_write(index, ids, "no such index"));
        };
        state.bulk_log.push((physical.clone(), ids));

        let mut items = Vec::with_capacity(documents.len());
        for doc in documents {
            if state.rejected_ids.contains(&doc.id) {
                items.push(BulkItemOutcome {
                    id: doc.id.clone(),
                    status: 400,
                    error: Some("mapper_parsing_exception (injected)".into()),
                });
                continue;
            }
            if let Some(docs) = state.indices.get_mut(&physical) {
                docs.insert(doc.id.clone(), doc.body.clone());
            }
            items.push(BulkItemOutcome {
                id: doc.id.clone(),
                status: 201,
                error: None,
            });
        }
        let keep = items.len().saturating_sub(state.forget_last_items);
        items.truncate(keep);
        Ok(BulkResult { items })
    }

    async fn alias_index_for(&self, alias: &str) -> IndexerResult<Option<String>> {
        Ok(lock(&self.state)
            .aliases
            .get(alias)
            .and_then(|targets| targets.iter().next().cloned()))
    }

    async fn alias_replace(&self, alias: &str, old: &str, new: &str) -> IndexerResult<()> {
        let mut state = lock(&self.state);
        if state.fail_alias_replace {
            return Err(IndexerError::lifecycle(
                "alias_replace",
                new,
                "alias swap rejected (injected)",
            ));
        }
        if !state.indices.contains_key(new) {
            return Err(IndexerError::lifecycle("alias_replace", new, "index does not exist"));
        }
        let bound = state
            .aliases
            .get(alias)
            .is_some_and(|targets| targets.contains(old));
        if !bound {
            return Err(IndexerError::lifecycle(
                "alias_replace",
                old,
                format!("alias '{alias}' does not point at '{old}'"),
            ));
        }
        let targets = state.aliases.entry(alias.to_string()).or_default();
        targets.remove(old);
        targets.insert(new.to_string());
        Ok(())
    }

    async fn alias_add(&self, alias: &str, name: &str) -> IndexerResult<()> {
        let mut state = lock(&self.state);
        if !state.indices.contains_key(name) {
            return Err(IndexerError::lifecycle("alias_add", name, "index does not exist"));
        }
        state
            .aliases
            .entry(alias.to_string())
            .or_default()
            .insert(name.to_string());
        Ok(())
    }
}
