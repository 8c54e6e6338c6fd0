//! Bounded retry with exponential backoff for rate-limited remote calls.

use std::{future::Future, time::Duration};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::error::{Error, ErrorKind, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            max_backoff,
        }
    }

    /// `min(2^attempt seconds, max_backoff)`, with `attempt` counted from zero.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with something other than a rate-limit
/// signal, or the attempt budget is spent.
///
/// Only [`ErrorKind::RateLimited`] errors are retried. Cancellation is checked
/// before every attempt and interrupts the backoff sleep.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    url: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() != ErrorKind::RateLimited => return Err(e),
            Err(_) if attempt + 1 >= attempts => {
                warn!(url, attempts, "rate limit retries exhausted");
                return Err(Error::RateLimited {
                    url: url.to_string(),
                    attempts,
                });
            },
            Err(_) => {
                let delay = policy.backoff_for(attempt);
                debug!(
                    url,
                    attempt = attempt + 1,
                    backoff_ms = delay.as_millis() as u64,
                    "rate limited, backing off"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {},
                }
                attempt += 1;
            },
        }
    }
}
