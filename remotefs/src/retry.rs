//! Bounded exponential backoff for remote calls that are safe to repeat.
//!
//! Only Stat and empty-content Put go through here. Every wait and every
//! in-flight attempt races the caller's cancellation token.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::FsError;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, `attempt` counting from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Run `operation` until it succeeds, the attempt budget is spent, or
/// `cancel` fires.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: &'static str,
    mut operation: F,
) -> Result<T, FsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FsError::Cancelled),
            res = operation() => res,
        };
        match outcome {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= max_attempts => {
                debug!("{op} failed on final attempt {attempt}: {e}");
                return Err(FsError::Unavailable {
                    op,
                    attempts: attempt,
                });
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                debug!("{op} attempt {attempt} failed: {e}, retrying in {delay:?}");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FsError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
