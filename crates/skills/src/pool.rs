//! Helpers shared by the bounded worker pools.

use std::sync::Arc;

use {
    tokio::{
        sync::{OwnedSemaphorePermit, Semaphore},
        task::JoinSet,
    },
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

use crate::error::{Error, Result};

/// Wait for a pool slot unless `cancel` fires first.
pub(crate) async fn acquire(
    permits: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        permit = Arc::clone(permits).acquire_owned() => permit.map_err(|_| Error::Cancelled),
    }
}

/// Drain `tasks`, re-raising panics. Items come back in completion order,
/// tagged with the index they were spawned with.
pub(crate) async fn collect_indexed<T: 'static>(
    tasks: &mut JoinSet<(usize, T)>,
) -> Vec<(usize, T)> {
    let mut out = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(item) => out.push(item),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => warn!(error = %e, "pool task aborted"),
        }
    }
    out
}
