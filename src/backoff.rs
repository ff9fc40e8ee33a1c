//! Exponential backoff shared by the mailbox and LLM clients.
//!
//! Delay grows as `base * 2^attempt` seconds, capped at a maximum, with an
//! optional jitter fraction. A provider-supplied `Retry-After` hint takes
//! precedence when it exceeds the computed delay.

use std::future::Future;
use std::time::Duration;

use rand::{Rng, thread_rng};
use tracing::{debug, warn};

use crate::error::SyncError;

/// Retry policy for provider calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first (default 3).
    pub max_attempts: u32,
    /// Base delay in seconds for the exponential schedule (default 1).
    pub base_seconds: u64,
    /// Upper bound for a single delay in seconds.
    pub max_seconds: u64,
    /// Jitter fraction applied on top of the computed delay (0.0-1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_seconds: 1,
            max_seconds: 300,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempts_completed` failed attempts.
    pub fn delay_for(&self, attempts_completed: u32, retry_after_hint: Option<u64>) -> Duration {
        let exp = (self.base_seconds as f64 * 2_f64.powi(attempts_completed as i32))
            .min(self.max_seconds as f64);

        let mut delay = exp;
        if let Some(hint) = retry_after_hint {
            delay = delay.max(hint as f64);
        }

        if self.jitter_factor > 0.0 && delay > 0.0 {
            delay += thread_rng().gen_range(0.0..(self.jitter_factor * delay));
        }

        Duration::from_secs_f64(delay)
    }

    /// Run `operation` until it succeeds, exhausting at most `max_attempts`.
    ///
    /// Only retryable errors (rate limits, transient transport failures) are
    /// retried; anything else propagates immediately.
    pub async fn retry<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt, err.retry_after_secs());
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(err);
                }
                Err(err) => {
                    debug!(operation = label, attempt = attempt + 1, error = %err, "Giving up");
                    return Err(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::transient("retry budget exhausted")))
    }
}
