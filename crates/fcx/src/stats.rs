//! 📊 StatsCollector: who made it into the index, and who didn't.
//!
//! Two maps, one mutex. Every increment touches both maps under the same lock, so a snapshot
//! never sees a batch half-counted. Counts only go up within a run. Whether a new reindex run
//! starts from zero is a config decision (`stats_mode`), not a vibe.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// 🔧 What `begin_run` does to the counters.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StatsMode {
    /// 🧹 Every reindex run reports only its own numbers.
    #[default]
    ResetPerRun,
    /// 📈 Counters live as long as the process does.
    Accumulate,
}

/// 📦 `{"load": {entity: n}, "error": {entity: n}}`: the artifact emitted after a reindex.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub load: BTreeMap<String, u64>,
    pub error: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    pub fn total_loaded(&self) -> u64 {
        self.load.values().sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.error.values().sum()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "load": self.load, "error": self.error })
    }
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    mode: StatsMode,
    inner: Mutex<StatsSnapshot>,
}

impl StatsCollector {
    pub fn new(mode: StatsMode) -> Self {
        Self {
            mode,
            inner: Mutex::new(StatsSnapshot::default()),
        }
    }

    // -- 🩹 a panicking holder can't corrupt two counters, so a poisoned lock is still good data
    fn lock(&self) -> MutexGuard<'_, StatsSnapshot> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 🎬 Called by the coordinator at the start of a reindex run.
    pub fn begin_run(&self) {
        if self.mode == StatsMode::ResetPerRun {
            debug!("🧹 resetting stats for a fresh run");
            *self.lock() = StatsSnapshot::default();
        }
    }

    pub fn record_error(&self, entity: &str, count: u64) {
        self.record_outcome(entity, 0, count);
    }

    /// ⚖️ Both sides of one entity's outcome in a single critical section.
    pub fn record_outcome(&self, entity: &str, loaded: u64, failed: u64) {
        if loaded == 0 && failed == 0 {
            return;
        }
        let mut stats = self.lock();
        if loaded > 0 {
            *stats.load.entry(entity.to_string()).or_default() += loaded;
        }
        if failed > 0 {
            *stats.error.entry(entity.to_string()).or_default() += failed;
        }
    }

    /// 🧾 Merge many entity outcomes at once, e.g. a whole bulk response.
    pub fn record_many<'a>(&self, outcomes: impl IntoIterator<Item = (&'a str, u64, u64)>) {
        let mut stats = self.lock();
        for (entity, loaded, failed) in outcomes {
            if loaded > 0 {
                *stats.load.entry(entity.to_string()).or_default() += loaded;
            }
            if failed > 0 {
                *stats.error.entry(entity.to_string()).or_default() += failed;
            }
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.lock().clone()
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.snapshot().to_json()
    }
}
