//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! 🎬 INT. SERVER ROOM: 3:47 AM. The alias points at last week's index. Last week's index is
//! missing forty thousand people. Somebody types "just reindex it". Everybody nods.
//!
//! 🚀 This module owns every HTTP conversation with the document index:
//! - `HEAD /<index>` (exists), `PUT /<index>` (create with mapping), `DELETE /<index>`
//! - `GET /<index>/_count`
//! - `POST /_bulk` with NDJSON action/document pairs
//! - `GET /_alias/<alias>` and `POST /_aliases` (remove + add in one request, atomic)
//!
//! It reports what Elasticsearch said, item by item, and nothing more. Deciding whether a bulk
//! call "worked" is somebody else's job. That somebody is the index worker. Good luck to them.
//!
//! 🔒 Auth: api key beats basic auth. This is not a democracy.
//!
//! 🦆

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::backends::{BulkItemOutcome, BulkResult, SearchIndex};
use crate::common::IndexDocument;
use crate::errors::{IndexerError, IndexerResult};

/// 🔧 The `[search]` config section.
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// 📡 Cluster URL. Include scheme + port. Yes, all of it.
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 Preferred over basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 🏷️ The alias readers query. Physical indices come and go behind it.
    pub alias: String,
    /// 🗺️ JSON file with the index settings + mappings used for every new physical index.
    #[serde(default)]
    pub mapping_file: Option<PathBuf>,
    /// 🆔 Where the document id lives inside a transformed document.
    #[serde(default = "default_id_field_path")]
    pub id_field_path: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 🗃️ When set, every bulk body is also written here as `<millis>-<n>.ndjson`.
    #[serde(default)]
    pub dump_dir: Option<PathBuf>,
}

fn default_id_field_path() -> String {
    "fiche.data._id".to_string()
}

// -- ⏱️ bulk calls can be meaty, we're not monsters
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug)]
pub struct ElasticsearchIndex {
    client: reqwest::Client,
    config: SearchConfig,
    dump_counter: AtomicU64,
}

impl ElasticsearchIndex {
    pub fn new(config: SearchConfig) -> IndexerResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                IndexerError::config(format!(
                    "💀 The HTTP client refused to be born. Probably TLS. Either way: tragic. {e}"
                ))
            })?;
        Ok(Self {
            client,
            config,
            dump_counter: AtomicU64::new(0),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    /// 🔒 api_key > basic auth > anonymous (good luck).
    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            request.header("Authorization", format!("ApiKey {api_key}"))
        } else if let Some(ref username) = self.config.username {
            request.basic_auth(username, self.config.password.as_ref())
        } else {
            request
        }
    }

    fn json_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.apply_auth(self.client.request(method, self.url(path)))
            .header("Content-Type", "application/json")
    }

    /// 📦 Action line + document line per document. `_id` makes re-sends overwrite.
    fn bulk_body(index: &str, documents: &[IndexDocument]) -> IndexerResult<String> {
        let mut body = String::with_capacity(documents.len() * 256);
        for doc in documents {
            let action = json!({"index": {"_index": index, "_id": doc.id}});
            let source = serde_json::to_string(&doc.body).map_err(|e| {
                IndexerError::index_write(index, vec![doc.id.clone()], e)
            })?;
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&source);
            body.push('\n');
        }
        Ok(body)
    }

    /// 🗃️ Best-effort copy of a bulk body on disk. A failed dump never fails the insert.
    async fn dump_bulk_body(&self, body: &str) {
        let Some(ref dir) = self.config.dump_dir else {
            return;
        };
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let n = self.dump_counter.fetch_add(1, Ordering::Relaxed);
        let file = dir.join(format!("{millis}-{n}.ndjson"));
        let written = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&file, body).await
        }
        .await;
        match written {
            Ok(()) => trace!(file = %file.display(), "🗃️ bulk body dumped"),
            Err(e) => warn!(file = %file.display(), "⚠️ could not dump bulk body: {e}"),
        }
    }

    /// 📬 Send, read the body, hand back (status, body). Transport failures become `String`s
    /// so each caller can file them under the right error family.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(u16, String), String> {
        let response = request
            .send()
            .await
            .map_err(|e| format!("error sending request: {e}"))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| format!("could not read response body: {e}"))?;
        Ok((status, body))
    }

    async fn lifecycle_call(
        &self,
        operation: &str,
        index: &str,
        request: reqwest::RequestBuilder,
    ) -> IndexerResult<(u16, String)> {
        self.send(request)
            .await
            .map_err(|e| IndexerError::lifecycle(operation, index, e))
    }
}

/// 🔍 `items[].index.{_id,status,error}` → outcomes. Unknown action keys are tolerated.
fn parse_bulk_response(index: &str, body: &str, sent: &[IndexDocument]) -> IndexerResult<BulkResult> {
    let all_ids = || sent.iter().map(|d| d.id.clone()).collect::<Vec<_>>();
    let parsed: Value = serde_json::from_str(body).map_err(|e| {
        IndexerError::index_write(index, all_ids(), format!("unparseable bulk response: {e}"))
    })?;
    let Some(items) = parsed.get("items").and_then(Value::as_array) else {
        return Err(IndexerError::index_write(
            index,
            all_ids(),
            "bulk response has no items",
        ));
    };

    let outcomes = items
        .iter()
        .filter_map(|item| {
            // -- {"index": {...}} normally, but "create"/"update" answer the same shape
            let inner = item.as_object()?.values().next()?;
            let id = match inner.get("_id")? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let status = inner
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(0);
            let error = inner.get("error").filter(|e| !e.is_null()).map(|e| {
                e.get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string())
            });
            Some(BulkItemOutcome { id, status, error })
        })
        .collect();
    Ok(BulkResult { items: outcomes })
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn exists(&self, name: &str) -> IndexerResult<bool> {
        let request = self.apply_auth(self.client.head(self.url(name)));
        let (status, body) = self.lifecycle_call("exists", name, request).await?;
        match status {
            200..=299 => Ok(true),
            404 => Ok(false),
            other => Err(IndexerError::lifecycle(
                "exists",
                name,
                format!("unexpected status {other}: {body}"),
            )),
        }
    }

    async fn create(&self, name: &str, mapping: Option<&Value>) -> IndexerResult<()> {
        let Some(mapping) = mapping else {
            return Err(IndexerError::lifecycle(
                "create",
                name,
                "no mapping supplied, refusing to create an index Elasticsearch would guess at",
            ));
        };
        if self.exists(name).await? {
            return Err(IndexerError::lifecycle("create", name, "index already exists"));
        }
        let payload = serde_json::to_vec(mapping)
            .map_err(|e| IndexerError::lifecycle("create", name, e))?;
        let request = self.json_request(reqwest::Method::PUT, name).body(payload);
        let (status, body) = self.lifecycle_call("create", name, request).await?;
        if !(200..300).contains(&status) {
            return Err(IndexerError::lifecycle(
                "create",
                name,
                format!("Elasticsearch said {status}: {body}"),
            ));
        }
        debug!(index = name, "🏗️ created index");
        Ok(())
    }

    async fn delete(&self, name: &str) -> IndexerResult<()> {
        let request = self.apply_auth(self.client.delete(self.url(name)));
        let (status, body) = self.lifecycle_call("delete", name, request).await?;
        match status {
            200..=299 => {
                debug!(index = name, "🗑️ deleted index");
                Ok(())
            }
            404 => Err(IndexerError::lifecycle("delete", name, "index does not exist")),
            other => Err(IndexerError::lifecycle(
                "delete",
                name,
                format!("Elasticsearch said {other}: {body}"),
            )),
        }
    }

    async fn count(&self, name: &str) -> IndexerResult<u64> {
        let request = self.apply_auth(self.client.get(self.url(&format!("{name}/_count"))));
        let (status, body) = self.lifecycle_call("count", name, request).await?;
        if !(200..300).contains(&status) {
            return Err(IndexerError::lifecycle(
                "count",
                name,
                format!("Elasticsearch said {status}: {body}"),
            ));
        }
        serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("count").and_then(Value::as_u64))
            .ok_or_else(|| IndexerError::lifecycle("count", name, format!("no count in '{body}'")))
    }

    async fn bulk_insert(
        &self,
        index: &str,
        documents: &[IndexDocument],
    ) -> IndexerResult<BulkResult> {
        if documents.is_empty() {
            return Ok(BulkResult::default());
        }
        let all_ids = || documents.iter().map(|d| d.id.clone()).collect::<Vec<_>>();
        let body = Self::bulk_body(index, documents)?;
        self.dump_bulk_body(&body).await;

        // ⚠️ application/x-ndjson, not application/json. Elasticsearch has opinions.
        let request = self
            .apply_auth(self.client.post(self.url("_bulk")))
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        let (status, response) = self
            .send(request)
            .await
            .map_err(|e| IndexerError::index_write(index, all_ids(), e))?;
        if !(200..300).contains(&status) {
            return Err(IndexerError::index_write(
                index,
                all_ids(),
                format!("bulk call answered {status}: {response}"),
            ));
        }
        let result = parse_bulk_response(index, &response, documents)?;
        trace!(index, sent = documents.len(), reported = result.items.len(), "🚀 bulk landed");
        Ok(result)
    }

    async fn alias_index_for(&self, alias: &str) -> IndexerResult<Option<String>> {
        let request = self.apply_auth(self.client.get(self.url(&format!("_alias/{alias}"))));
        let (status, body) = self.lifecycle_call("alias_get", alias, request).await?;
        if status == 404 {
            return Ok(None);
        }
        if !(200..300).contains(&status) {
            return Err(IndexerError::lifecycle(
                "alias_get",
                alias,
                format!("Elasticsearch said {status}: {body}"),
            ));
        }
        // -- answer shape: {"<index>": {"aliases": {"<alias>": {}}}}
        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| IndexerError::lifecycle("alias_get", alias, e))?;
        let mut indices: Vec<String> = parsed
            .as_object()
            .map(|obj| obj.keys().cloned().collect())
            .unwrap_or_default();
        indices.sort();
        if indices.len() > 1 {
            warn!(alias, ?indices, "⚠️ alias points at more than one index, using the first");
        }
        Ok(indices.into_iter().next())
    }

    async fn alias_replace(&self, alias: &str, old: &str, new: &str) -> IndexerResult<()> {
        let actions = json!({
            "actions": [
                {"remove": {"index": old, "alias": alias}},
                {"add": {"index": new, "alias": alias}}
            ]
        });
        self.post_aliases("alias_replace", new, &actions).await
    }

    async fn alias_add(&self, alias: &str, name: &str) -> IndexerResult<()> {
        let actions = json!({"actions": [{"add": {"index": name, "alias": alias}}]});
        self.post_aliases("alias_add", name, &actions).await
    }
}

impl ElasticsearchIndex {
    async fn post_aliases(&self, operation: &str, index: &str, actions: &Value) -> IndexerResult<()> {
        let payload =
            serde_json::to_vec(actions).map_err(|e| IndexerError::lifecycle(operation, index, e))?;
        let request = self
            .json_request(reqwest::Method::POST, "_aliases")
            .body(payload);
        let (status, body) = self.lifecycle_call(operation, index, request).await?;
        if !(200..300).contains(&status) {
            return Err(IndexerError::lifecycle(
                operation,
                index,
                format!("Elasticsearch said {status}: {body}"),
            ));
        }
        let acknowledged = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("acknowledged").and_then(Value::as_bool))
            .unwrap_or(true);
        if !acknowledged {
            return Err(IndexerError::lifecycle(operation, index, "alias change not acknowledged"));
        }
        Ok(())
    }
}
