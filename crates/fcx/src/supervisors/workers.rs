//! 🧵 Workers: the ones who actually do the work while the pools take all the credit.
//!
//! ⚠️ Private to `supervisors`. Pools start them, pools stop them, nobody else touches them.

use anyhow::Result;
use tokio::task::JoinHandle;

pub(super) mod index_worker;
pub(super) mod loader_worker;

pub(super) use index_worker::IndexWorker;
pub(super) use loader_worker::{IdTicket, LoadProgress, LoaderWorker};

/// 🏗️ A background worker, that does work. duh.
///
/// `start` consumes the worker and hands back the join handle. The loop inside checks its
/// `WorkerContext` between iterations and returns `Ok(())` when told to stop.
pub(super) trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}
