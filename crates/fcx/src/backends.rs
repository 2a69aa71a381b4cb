//! 🔌 Backends: where the real I/O happens.
//!
//! 🚰 A `MetadataSource` pours records out of the graph, a `SearchIndex` takes documents in.
//! Everything between the two is pipeline plumbing and none of it knows which concrete
//! backend it is talking to.
//!
//! 🎭 Same casting agency as always: a trait per role, an enum per role that dispatches to the
//! concrete implementation. HTTP for the real world, in-memory for tests and local runs.
//!
//! 🦆 The duck is here because every file must have one.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::common::IndexDocument;
use crate::errors::IndexerResult;
use crate::registry::EntityDescriptor;

pub mod elasticsearch;
pub mod http_metadata;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchIndex, SearchConfig};
pub use http_metadata::{HttpMetadataSource, MetadataConfig};
pub use in_mem::{InMemoryIndex, InMemoryMetadataSource};

// ===== MetadataSource =====

/// 📡 The metadata graph, reduced to the two questions we ever ask it.
///
/// # Contract
/// - `enumerate` returns at most `limit` ids of the entity's type starting at `offset`.
///   An empty page means the well is dry.
/// - `fetch` returns the full record or a `Fetch` error. A null body is an error, not a record.
/// - Neither method retries. Retrying is the loader pool's job.
#[async_trait]
pub trait MetadataSource: std::fmt::Debug + Send + Sync {
    async fn enumerate(
        &self,
        entity: &EntityDescriptor,
        offset: usize,
        limit: usize,
    ) -> IndexerResult<Vec<String>>;

    async fn fetch(&self, id: &str) -> IndexerResult<Value>;
}

#[derive(Debug)]
pub enum MetadataSourceBackend {
    Http(HttpMetadataSource),
    InMemory(InMemoryMetadataSource),
}

#[async_trait]
impl MetadataSource for MetadataSourceBackend {
    async fn enumerate(
        &self,
        entity: &EntityDescriptor,
        offset: usize,
        limit: usize,
    ) -> IndexerResult<Vec<String>> {
        match self {
            MetadataSourceBackend::Http(source) => source.enumerate(entity, offset, limit).await,
            MetadataSourceBackend::InMemory(source) => {
                source.enumerate(entity, offset, limit).await
            }
        }
    }

    async fn fetch(&self, id: &str) -> IndexerResult<Value> {
        match self {
            MetadataSourceBackend::Http(source) => source.fetch(id).await,
            MetadataSourceBackend::InMemory(source) => source.fetch(id).await,
        }
    }
}

// ===== SearchIndex =====

/// 📄 What the index said about one document in a bulk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemOutcome {
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemOutcome {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.error.is_none()
    }
}

/// 📋 The per-item report of a bulk call, exactly as the index gave it.
///
/// Not reconciled. If the index forgot to mention a document, so does this struct.
/// Figuring out who went missing is the caller's job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResult {
    pub items: Vec<BulkItemOutcome>,
}

impl BulkResult {
    /// ✅ Ids the index claims it wrote.
    pub fn written_ids(&self) -> HashSet<&str> {
        self.items
            .iter()
            .filter(|item| item.is_success())
            .map(|item| item.id.as_str())
            .collect()
    }

    /// 💀 Items that came back with an error or a non-2xx status.
    pub fn failures(&self) -> impl Iterator<Item = &BulkItemOutcome> {
        self.items.iter().filter(|item| !item.is_success())
    }
}

/// 🗄️ The physical-index-and-alias protocol of the document index.
///
/// # Contract
/// - `create` fails if the index already exists or no mapping was supplied.
/// - `delete` fails if the index does not exist.
/// - `alias_replace` moves the alias from `old` to `new` in one atomic call, so readers never
///   see the alias pointing at zero or two indices.
/// - `bulk_insert` reports per-item outcomes faithfully and only fails outright when the whole
///   call failed. Reconciliation happens upstream.
#[async_trait]
pub trait SearchIndex: std::fmt::Debug + Send + Sync {
    async fn exists(&self, name: &str) -> IndexerResult<bool>;
    async fn create(&self, name: &str, mapping: Option<&Value>) -> IndexerResult<()>;
    async fn delete(&self, name: &str) -> IndexerResult<()>;
    async fn count(&self, name: &str) -> IndexerResult<u64>;
    async fn bulk_insert(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> IndexerResult<BulkResult>;
    async fn alias_index_for(&self, alias: &str) -> IndexerResult<Option<String>>;
    async fn alias_replace(&self, alias: &str, old: &str, new: &str) -> IndexerResult<()>;
    async fn alias_add(&self, alias: &str, name: &str) -> IndexerResult<()>;
}

#[derive(Debug)]
pub enum SearchIndexBackend {
    Elasticsearch(ElasticsearchIndex),
    InMemory(InMemoryIndex),
}

#[async_trait]
impl SearchIndex for SearchIndexBackend {
    async fn exists(&self, name: &str) -> IndexerResult<bool> {
        match self {
            SearchIndexBackend::Elasticsearch(index) => index.exists(name).await,
            SearchIndexBackend::InMemory(index) => index.exists(name).await,
        }
    }

    async fn create(&self, name: &str, mapping: Option<&Value>) -> IndexerResult<()> {
        match self {
            SearchIndexBackend::Elasticsearch(index) => index.create(name, mapping).await,
            SearchIndexBackend::InMemory(index) => index.create(name, mapping).await,
        }
    }

    async fn delete(&self, name: &str) -> IndexerResult<()> {
        match self {
            SearchIndexBackend::Elasticsearch(index) => index.delete(name).await,
            SearchIndexBackend::InMemory(index) => index.delete(name).await,
        }
    }

    async fn count(&self, name: &str) -> IndexerResult<u64> {
        match self {
            SearchIndexBackend::Elasticsearch(index) => index.count(name).await,
            SearchIndexBackend::InMemory(index) => index.count(name).await,
        }
    }

    async fn bulk_insert(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> IndexerResult<BulkResult> {
        match self {
            SearchIndexBackend::Elasticsearch(es) => es.bulk_insert(index, documents).await,
            SearchIndexBackend::InMemory(mem) => mem.bulk_insert(index, documents).await,
        }
    }

    async fn alias_index_for(&self, alias: &str) -> IndexerResult<Option<String>> {
        match self {
            SearchIndexBackend::Elasticsearch(index) => index.alias_index_for(alias).await,
            SearchIndexBackend::InMemory(index) => index.alias_index_for(alias).await,
        }
    }

    async fn alias_replace(&self, alias: &str, old: &str, new: &str) -> IndexerResult<()> {
        match self {
            SearchIndexBackend::Elasticsearch(index) => index.alias_replace(alias, old, new).await,
            SearchIndexBackend::InMemory(index) => index.alias_replace(alias, old, new).await,
        }
    }

    async fn alias_add(&self, alias: &str, name: &str) -> IndexerResult<()> {
        match self {
            SearchIndexBackend::Elasticsearch(index) => index.alias_add(alias, name).await,
            SearchIndexBackend::InMemory(index) => index.alias_add(alias, name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, status: u16, error: Option<&str>) -> BulkItemOutcome {
        BulkItemOutcome {
            id: id.into(),
            status,
            error: error.map(Into::into),
        }
    }

    #[test]
    fn the_one_where_only_clean_2xx_items_count_as_written() {
        let result = BulkResult {
            items: vec![
                outcome("P1", 201, None),
                outcome("P2", 200, None),
                outcome("P3", 400, Some("mapper_parsing_exception")),
                outcome("P4", 201, Some("weird but still an error")),
            ],
        };
        let written = result.written_ids();
        assert_eq!(written.len(), 2);
        assert!(written.contains("P1") && written.contains("P2"));
        let failed: Vec<_> = result.failures().map(|f| f.id.as_str()).collect();
        assert_eq!(failed, vec!["P3", "P4"]);
    }
}
