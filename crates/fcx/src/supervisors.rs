//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where workers toil endlessly..."
//! 🎬 "Two pools dared to share one queue."
//!
//! 📦 The Supervisor module: the loader pool fills the work queue, the index pool empties it,
//! and both answer to the same three-step exit interview:
//! 1. the cooperative running flag goes false, workers notice between iterations;
//! 2. each worker gets a bounded join;
//! 3. stragglers are aborted and named in the logs. Aborting can lose an in-memory batch.
//!    That is what "forced" means.
//!
//! ⚠️ The workers themselves stay private. Like Fight Club, but for async tasks.

mod indexer_pool;
mod loader_pool;
mod workers;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use indexer_pool::{ActiveTarget, IndexWorkerPool, IndexerSettings};
pub use loader_pool::{EntityLoaderPool, LoadSummary, LoaderSettings, MAX_FETCH_ATTEMPTS};

/// 🪪 What a worker is told about itself: its name, and whether its pool still wants it.
///
/// Replaces any notion of a global "are we running" switch. One flag per pool, shared by
/// every worker the pool started.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    name: String,
    running: Arc<AtomicBool>,
}

impl WorkerContext {
    pub fn new(name: impl Into<String>, running: Arc<AtomicBool>) -> Self {
        Self {
            name: name.into(),
            running,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 🧵 A spawned worker and the name it answers to.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) name: String,
    pub(crate) handle: JoinHandle<anyhow::Result<()>>,
}

impl WorkerHandle {
    pub(crate) fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// 🗑️ Join every worker with a per-worker timeout, aborting whoever overstays.
/// Returns the names of workers that did not exit cleanly.
pub(crate) async fn join_workers(
    pool: &str,
    handles: Vec<WorkerHandle>,
    timeout: Duration,
) -> Vec<String> {
    let joins = handles.into_iter().map(|worker| async move {
        let WorkerHandle { name, mut handle } = worker;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => {
                debug!(pool, worker = %name, "🏁 worker exited cleanly");
                None
            }
            Ok(Ok(Err(err))) => {
                warn!(pool, worker = %name, "💀 worker exited with an error: {err:#}");
                Some(name)
            }
            Ok(Err(join_err)) => {
                warn!(pool, worker = %name, "💀 worker panicked or was cancelled: {join_err}");
                Some(name)
            }
            Err(_) => {
                handle.abort();
                warn!(
                    pool,
                    worker = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "🔪 worker did not stop in time, aborted"
                );
                Some(name)
            }
        }
    });
    join_all(joins).await.into_iter().flatten().collect()
}
