//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Figment layers `FCX_*` environment variables under an optional TOML file. Nested keys
//! use a double underscore: `FCX_SEARCH__URL`, `FCX_RUNTIME__INDEXER_WORKERS`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{MetadataConfig, SearchConfig};
use crate::batching::BatchingConfig;
use crate::errors::{IndexerError, IndexerResult};
use crate::registry::EntityConfig;
use crate::stats::StatsMode;
use crate::supervisors::{IndexerSettings, LoaderSettings};
use crate::transforms::RulesConfig;

/// 📦 One struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub metadata: MetadataConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
}

/// 🧵 Pool sizes, timeouts and the other knobs nobody touches until 3am.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub loader_workers: usize,
    #[serde(default = "default_workers")]
    pub indexer_workers: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_loader_high_water")]
    pub loader_high_water: usize,
    #[serde(default = "default_backpressure_pause_ms")]
    pub backpressure_pause_ms: u64,
    #[serde(default = "default_id_buffer")]
    pub id_buffer: usize,
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
    #[serde(default)]
    pub stats_mode: StatsMode,
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_workers() -> usize {
    4
}
fn default_shutdown_timeout_secs() -> u64 {
    5
}
fn default_retry_delay_ms() -> u64 {
    10_000
}
fn default_loader_high_water() -> usize {
    1_000
}
fn default_backpressure_pause_ms() -> u64 {
    1_000
}
fn default_id_buffer() -> usize {
    10_000
}
fn default_drain_poll_interval_ms() -> u64 {
    5_000
}
fn default_show_progress() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            loader_workers: default_workers(),
            indexer_workers: default_workers(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            loader_high_water: default_loader_high_water(),
            backpressure_pause_ms: default_backpressure_pause_ms(),
            id_buffer: default_id_buffer(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            stats_mode: StatsMode::default(),
            show_progress: default_show_progress(),
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

impl AppConfig {
    /// 🚦 The things serde can't catch: nonsense that parses fine.
    pub fn validate(&self) -> IndexerResult<()> {
        if self.batching.min_batch_size > self.batching.max_batch_size {
            return Err(IndexerError::config(format!(
                "batching.min_batch_size ({}) is larger than batching.max_batch_size ({})",
                self.batching.min_batch_size, self.batching.max_batch_size
            )));
        }
        if self.batching.max_batch_size == 0 {
            return Err(IndexerError::config("batching.max_batch_size must be at least 1"));
        }
        if self.runtime.loader_workers == 0 {
            return Err(IndexerError::config("runtime.loader_workers must be at least 1"));
        }
        if self.runtime.indexer_workers == 0 {
            return Err(IndexerError::config("runtime.indexer_workers must be at least 1"));
        }
        if self.search.alias.trim().is_empty() {
            return Err(IndexerError::config("search.alias must not be empty"));
        }
        Ok(())
    }

    pub fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            workers: self.runtime.loader_workers,
            page_size: self.metadata.page_size,
            retry_delay: Duration::from_millis(self.runtime.retry_delay_ms),
            high_water: self.runtime.loader_high_water,
            backpressure_pause: Duration::from_millis(self.runtime.backpressure_pause_ms),
            id_buffer: self.runtime.id_buffer,
            shutdown_timeout: self.runtime.shutdown_timeout(),
            ..LoaderSettings::default()
        }
    }

    pub fn indexer_settings(&self) -> IndexerSettings {
        IndexerSettings {
            workers: self.runtime.indexer_workers,
            shutdown_timeout: self.runtime.shutdown_timeout(),
            batching: self.batching.clone(),
        }
    }

    /// 🗺️ Where the index mapping lives. A reindex can't create anything without it.
    pub fn mapping_file(&self) -> Option<&PathBuf> {
        self.search.mapping_file.as_ref()
    }
}

/// 🚀 Load the config: from a file, from env vars, or from the sheer power of hoping.
///
/// - `None` → env vars only.
/// - `Some(path)` → env vars + TOML file, merged. TOML wins on conflicts.
///
/// The result is validated before it's handed back.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("FCX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (FCX_*). \
             The file exists in our hearts, but apparently not on disk.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (FCX_*). \
                 No file was provided, this one's all on the environment. Classic."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config
        .validate()
        .context("💀 Configuration parsed, but it doesn't make sense")?;
    Ok(app_config)
}
