//! 📡 HttpMetadataSource: the metadata graph, spoken to over plain HTTP.
//!
//! Two endpoints, both GET:
//! - `{url}/{enumerate_path}?type=<T>&limit=<n>&offset=<n>` answers a JSON array of ids.
//! - `{url}/{fetch_path}?id=<id>&depth=<d>` answers the record.
//!
//! Every call carries its own short timeout. The graph is either quick or wrong.
//! Non-2xx, unparseable, and `null` answers all come back as `Fetch` errors so the
//! loader pool can retry them without caring which flavour of broken it was. 🦆

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use crate::backends::MetadataSource;
use crate::errors::{IndexerError, IndexerResult};
use crate::registry::EntityDescriptor;

/// 🔧 The `[metadata]` config section.
#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    /// 📡 Base URL, scheme and port included.
    pub url: String,
    #[serde(default = "default_enumerate_path")]
    pub enumerate_path: String,
    #[serde(default = "default_fetch_path")]
    pub fetch_path: String,
    /// 🕸️ How deep the graph should resolve linked nodes when fetching a record.
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_enumerate_path() -> String {
    "enumerate".to_string()
}

fn default_fetch_path() -> String {
    "fetch".to_string()
}

fn default_depth() -> u32 {
    5
}

// -- 📦 a thousand ids per page, same as the graph's own default
fn default_page_size() -> usize {
    1000
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone)]
pub struct HttpMetadataSource {
    client: reqwest::Client,
    config: MetadataConfig,
}

impl HttpMetadataSource {
    pub fn new(config: MetadataConfig) -> IndexerResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.fetch_timeout_secs.max(1)))
            .build()
            .map_err(|e| {
                IndexerError::config(format!("💀 could not build the metadata HTTP client: {e}"))
            })?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<reqwest::Url, String> {
        let raw = format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        reqwest::Url::parse_with_params(&raw, params).map_err(|e| format!("bad url '{raw}': {e}"))
    }

    /// 📬 GET a URL, insist on 2xx, parse the body as JSON. Errors come back as plain strings;
    /// the caller decides which id to pin them on.
    async fn get_json(&self, url: reqwest::Url) -> Result<Value, String> {
        let mut request = self
            .client
            .get(url.clone())
            .timeout(Duration::from_secs(self.config.fetch_timeout_secs))
            .header("Accept", "application/json");
        if let Some(ref token) = self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("error sending request to {url}: {e}"))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| format!("could not read response body: {e}"))?;
        if !status.is_success() {
            return Err(format!("metadata source answered {status}: {body}"));
        }
        trace!(%url, bytes = body.len(), "📡 metadata response");
        serde_json::from_str(&body).map_err(|e| format!("malformed JSON from metadata source: {e}"))
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn enumerate(
        &self,
        entity: &EntityDescriptor,
        offset: usize,
        limit: usize,
    ) -> IndexerResult<Vec<String>> {
        let page_label = format!("{}[{offset}..+{limit}]", entity.name);
        let url = self
            .endpoint(
                &self.config.enumerate_path,
                &[
                    ("type", entity.name.clone()),
                    ("limit", limit.to_string()),
                    ("offset", offset.to_string()),
                ],
            )
            .map_err(|e| IndexerError::fetch(&page_label, e))?;

        let body = self
            .get_json(url)
            .await
            .map_err(|e| IndexerError::fetch(&page_label, e))?;

        let Value::Array(entries) = body else {
            return Err(IndexerError::fetch(
                &page_label,
                "enumeration did not answer a JSON array",
            ));
        };
        // -- ids may come back as bare strings or as {"id": "..."} rows, both are fine
        entries
            .into_iter()
            .map(|entry| match entry {
                Value::String(id) => Ok(id),
                Value::Object(ref row) => match row.get("id") {
                    Some(Value::String(id)) => Ok(id.clone()),
                    _ => Err(IndexerError::fetch(&page_label, format!("row without id: {entry}"))),
                },
                other => Err(IndexerError::fetch(&page_label, format!("unexpected id {other}"))),
            })
            .collect()
    }

    async fn fetch(&self, id: &str) -> IndexerResult<Value> {
        let url = self
            .endpoint(
                &self.config.fetch_path,
                &[("id", id.to_string()), ("depth", self.config.depth.to_string())],
            )
            .map_err(|e| IndexerError::fetch(id, e))?;

        match self.get_json(url).await {
            Ok(Value::Null) => Err(IndexerError::fetch(id, "metadata source answered null")),
            Ok(record) => Ok(record),
            Err(reason) => Err(IndexerError::fetch(id, reason)),
        }
    }
}
