//! 🗂️ fcx: concurrent entity ingestion and blue/green reindexing.
//!
//! 🎬 *[narrator voice]* "Records go in. Documents come out. The alias never blinks."
//!
//! Loader workers fetch records from the metadata graph into a shared [`queue::WorkQueue`];
//! index workers drain it in adaptively sized batches and bulk-write them to the search index.
//! A wildcard trigger rebuilds everything into a fresh physical index and swaps the alias over.

pub mod app_config;
pub mod backends;
pub mod batching;
pub mod common;
pub mod errors;
pub mod indexer;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod reindex;
pub mod service;
pub mod stats;
pub mod supervisors;
pub mod transforms;

use std::future::Future;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::app_config::AppConfig;
use crate::service::{IndexerService, Trigger, TriggerOutcome};
use crate::stats::StatsSnapshot;

pub use crate::errors::{IndexerError, IndexerResult};

/// 📋 What a CLI run did, trigger by trigger.
#[derive(Debug)]
pub struct RunReport {
    pub outcomes: Vec<TriggerOutcome>,
    /// (trigger, error) for every trigger that failed
    pub failures: Vec<(String, String)>,
    pub stats: StatsSnapshot,
    /// Workers that had to be aborted on the way out
    pub unclean_workers: Vec<String>,
    pub interrupted: bool,
}

/// 🚀 Start the service, work through `triggers` in order, shut down gracefully.
///
/// A failing trigger is logged and recorded; the next one still runs. `shutdown` resolving
/// (ctrl-c in the CLI) stops after the trigger in flight is abandoned.
pub async fn run(
    config: AppConfig,
    triggers: Vec<String>,
    shutdown: impl Future<Output = ()>,
) -> Result<RunReport> {
    let service = IndexerService::from_config(&config)
        .await
        .context("💀 Failed to build the indexer service")?;
    service
        .start()
        .await
        .context("💀 Failed to start the indexer service. Is the search index reachable?")?;

    let mut outcomes = Vec::new();
    let mut failures = Vec::new();
    let mut interrupted = false;
    tokio::pin!(shutdown);

    for raw in triggers {
        let Some(trigger) = Trigger::parse(&raw) else {
            continue;
        };
        info!(trigger = ?trigger, "📬 handling trigger");
        tokio::select! {
            result = service.handle(trigger) => match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!(trigger = %raw, kind = err.kind(), "💀 trigger failed: {err}");
                    failures.push((raw, err.to_string()));
                }
            },
            _ = &mut shutdown => {
                warn!("🛑 shutdown requested, abandoning remaining triggers");
                interrupted = true;
                break;
            }
        }
    }

    let unclean_workers = service.shutdown().await;
    Ok(RunReport {
        outcomes,
        failures,
        stats: service.stats(),
        unclean_workers,
        interrupted,
    })
}
