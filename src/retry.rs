//! Retry and backoff policy
//!
//! Bounded exponential backoff shared by storage retries, queue redrain
//! bookkeeping and client reconnection.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

/// Bounded exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Base delay in milliseconds (doubles per attempt)
    pub base_delay_ms: u64,
    /// Ceiling for a single delay in milliseconds
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Create a new policy
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, 0, 0)
    }

    /// Delay to wait after the given (zero-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Run a blocking operation, retrying retryable failures
    pub fn run_blocking<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_retryable() && self.allows(attempt + 1) => {
                    let delay = self.delay_for(attempt);
                    warn!("Retryable failure (attempt {}): {}. Retrying in {:?}", attempt + 1, e, delay);
                    pause(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Sleep between blocking attempts
///
/// On a multi-threaded tokio runtime the worker hands its other tasks off
/// before sleeping, so a busy database does not stall unrelated sessions.
fn pause(delay: Duration) {
    if delay.is_zero() {
        return;
    }
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(delay))
        }
        _ => std::thread::sleep(delay),
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 50, 2_000)
    }
}
