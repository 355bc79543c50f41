//! Retries for transient registry failures.
//!
//! A registry call that fails with [`RegistryError::Transport`] or
//! [`RegistryError::Timeout`] is attempted again after an exponentially
//! growing, capped and jittered delay. Any other error ends the call at once.
//! `NotFound` in particular is an answer, not a failure.
//!
//! With the defaults a call is attempted at most four times:
//!
//! ```text
//! attempt 1 ── fail ── ~100ms ── attempt 2 ── fail ── ~200ms ── attempt 3 ── fail ── ~400ms ── attempt 4
//! ```

use crate::error::RegistryError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How many times, and how patiently, to retry a registry call.
///
/// The delay before retry `n` (0-indexed) is
/// `min(initial_backoff * backoff_multiplier^n, max_backoff)`, scaled by a
/// random factor in `[0.75, 1.25)` when `jitter` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(5), 2.0)
    }
}

impl RetryPolicy {
    /// Jittered policy.
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Single attempt, no retries.
    pub fn no_retries() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO, 1.0).with_jitter(false)
    }

    /// Un-jittered delay before retry `retry`.
    pub fn backoff(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let millis =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        if millis.is_finite() && millis < self.max_backoff.as_millis() as f64 {
            Duration::from_millis(millis as u64)
        } else {
            self.max_backoff
        }
    }

    /// Delays to sleep between attempts, one per allowed retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(move |retry| {
            let backoff = self.backoff(retry);
            if self.jitter {
                backoff.mul_f64(rand::thread_rng().gen_range(0.75..1.25))
            } else {
                backoff
            }
        })
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy` runs out of retries. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T, RegistryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    let mut delays = policy.delays();
    let mut attempt = 1;

    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempts = attempt, "Registry call recovered after retry");
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => error,
        };

        let Some(delay) = delays.next() else {
            warn!(attempts = attempt, error = %error, "Registry call failed, retries exhausted");
            return Err(error);
        };

        warn!(
            attempt = attempt,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "Registry call failed, retrying"
        );
        sleep(delay).await;
        attempt += 1;
    }
}
