//! Retry state machine with exponential backoff.
//!
//! Every attempt ends in an [`AttemptOutcome`]:
//! - `Success` stops the loop with a value
//! - `TransientFailure` is retried while retry budget remains
//! - `FatalFailure` stops the loop immediately
//!
//! Delay before retry `n` (1-indexed) is `base_delay * 2^(n-1)`, capped at
//! `max_delay`. A server-provided hint (e.g. `Retry-After`) can only lengthen
//! the delay, never beyond the cap. Jitter is opt-in.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::NetworkConfig;

/// Result of a single attempt, as seen by the retry loop.
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    TransientFailure(E),
    FatalFailure(E),
}

impl<T, E> AttemptOutcome<T, E> {
    /// Classify a plain result with a transient-error predicate.
    pub fn classify(result: Result<T, E>, is_transient: impl Fn(&E) -> bool) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(e) if is_transient(&e) => AttemptOutcome::TransientFailure(e),
            Err(e) => AttemptOutcome::FatalFailure(e),
        }
    }
}

/// Next transition of the retry state machine after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Sleep for `delay`, then run retry number `retry`.
    Retry { retry: u32, delay: Duration },
    /// Budget exhausted.
    GiveUp,
}

/// Errors that can carry a server-requested minimum delay.
pub trait RetryHint {
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryHint for String {}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt; total attempts are `1 + max_retries`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: NetworkConfig::MAX_RETRIES,
            base_delay: NetworkConfig::RETRY_BASE_DELAY,
            max_delay: NetworkConfig::RETRY_MAX_DELAY,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that never retries.
    pub fn none() -> Self {
        Self::default().with_max_retries(0)
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Random factor in 0.5..1.5 keeps the mean delay while avoiding near-zero delays.
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    /// Transition after a transient failure of attempt `attempt` (1-indexed).
    pub fn next_step(&self, attempt: u32, hint: Option<Duration>) -> RetryStep {
        if attempt > self.max_retries {
            return RetryStep::GiveUp;
        }

        let backoff = self.calculate_delay(attempt);
        let delay = match hint {
            Some(hint) => backoff.max(hint).min(self.max_delay),
            None => backoff,
        };

        RetryStep::Retry {
            retry: attempt,
            delay,
        }
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay accumulated.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

/// Run an operation through the retry state machine.
///
/// `operation` receives the 1-indexed attempt number.
pub async fn retry_async<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> (Result<T, E>, RetryStats)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T, E>>,
    E: std::fmt::Display + RetryHint,
{
    let mut stats = RetryStats::default();
    let mut attempt = 1;

    loop {
        stats.attempts = attempt;

        let error = match operation(attempt).await {
            AttemptOutcome::Success(value) => {
                stats.success = true;
                if attempt > 1 {
                    debug!("Operation succeeded after {} attempts", attempt);
                }
                return (Ok(value), stats);
            }
            AttemptOutcome::FatalFailure(e) => {
                debug!("Error is not retryable: {}", e);
                stats.last_error = Some(e.to_string());
                return (Err(e), stats);
            }
            AttemptOutcome::TransientFailure(e) => e,
        };

        stats.last_error = Some(error.to_string());

        match config.next_step(attempt, error.retry_after()) {
            RetryStep::GiveUp => {
                warn!(
                    "All {} attempts exhausted. Last error: {}",
                    config.max_attempts(),
                    error
                );
                return (Err(error), stats);
            }
            RetryStep::Retry { delay, .. } => {
                stats.total_delay += delay;
                warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt,
                    config.max_attempts(),
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
