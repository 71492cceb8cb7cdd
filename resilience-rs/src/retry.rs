//! # Retry Mechanism
//!
//! Re-invokes a failing async operation after an exponentially growing,
//! optionally jittered delay, up to a bounded number of attempts.
//!
//! The delay applied after attempt `n` (1-based) is
//! `min(base_delay * exponential_base^(n-1) * backoff_multiplier, max_delay)`.
//! With jitter enabled the delay is perturbed by up to ±25% and floored at
//! [`MIN_JITTERED_DELAY`]. No delay follows the final attempt.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::types::{Error, ErrorKind, Result};

/// Fraction of the computed delay that jitter may add or remove
pub const JITTER_FRACTION: f64 = 0.25;

/// Lower bound for a jittered delay
pub const MIN_JITTERED_DELAY: Duration = Duration::from_millis(10);

/// Immutable description of how an operation is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    exponential_base: f64,
    jitter: bool,
    backoff_multiplier: f64,
    retryable: HashSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
            backoff_multiplier: 1.0,
            retryable: [ErrorKind::Timeout, ErrorKind::Unavailable].into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy from every parameter
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        exponential_base: f64,
        jitter: bool,
        backoff_multiplier: f64,
        retryable: impl IntoIterator<Item = ErrorKind>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            exponential_base,
            jitter,
            backoff_multiplier,
            retryable: retryable.into_iter().collect(),
        }
    }

    /// A policy that runs the operation exactly once
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Default policy with a fixed number of attempts
    pub fn fixed(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Policy tuned for calls to remote telemetry stores
    pub fn network() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_exponential_base(mut self, exponential_base: f64) -> Self {
        self.exponential_base = exponential_base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_backoff_multiplier(mut self, backoff_multiplier: f64) -> Self {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// Checks if an error kind is worth another attempt under this policy
    pub fn is_retryable(&self, error: &Error) -> bool {
        self.retryable.contains(&error.kind())
    }

    /// Deterministic delay applied after attempt `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay.as_secs_f64()
            * self.exponential_base.powi(exponent)
            * self.backoff_multiplier;
        let capped = raw.min(self.max_delay.as_secs_f64());

        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped.is_finite() {
            Duration::ZERO
        } else {
            self.max_delay
        }
    }

    /// Delay actually slept after attempt `attempt`, jitter included
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter {
            return delay;
        }

        let offset = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered = delay.as_secs_f64() * (1.0 + offset);
        Duration::from_secs_f64(jittered.max(MIN_JITTERED_DELAY.as_secs_f64()))
    }

    /// Executes an async operation, retrying retryable failures.
    ///
    /// Non-retryable errors are returned as-is after the attempt that raised
    /// them. When every attempt fails, the last error is wrapped in
    /// [`Error::RetryExhausted`].
    pub async fn retry<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start_time = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            counter!("retry_attempts_total", 1, "operation" => operation_name.to_string());

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = %operation_name,
                            attempt = attempt,
                            duration_ms = %start_time.elapsed().as_millis(),
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.is_retryable(&error) {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %error,
                    "Error is not retryable"
                );
                return Err(error);
            }

            if attempt >= self.max_attempts {
                warn!(
                    operation = %operation_name,
                    attempts = attempt,
                    duration_ms = %start_time.elapsed().as_millis(),
                    error = %error,
                    "Giving up after retries"
                );
                counter!("retry_exhausted_total", 1, "operation" => operation_name.to_string());
                histogram!(
                    "retry_exhausted_duration_seconds",
                    start_time.elapsed().as_secs_f64(),
                    "operation" => operation_name.to_string()
                );
                return Err(Error::RetryExhausted {
                    attempts: attempt,
                    last_error: Box::new(error),
                });
            }

            let delay = self.backoff(attempt);
            debug!(
                operation = %operation_name,
                attempt = attempt,
                max_attempts = self.max_attempts,
                backoff_ms = %delay.as_millis(),
                error = %error,
                "Retrying after error"
            );
            sleep(delay).await;
        }
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryPolicy(max_attempts={}, base={:?}, max={:?}, jitter={})",
            self.max_attempts, self.base_delay, self.max_delay, self.jitter
        )
    }
}

/// Helper function to retry an operation under a policy
pub async fn retry<F, Fut, T>(operation_name: &str, policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.retry(operation_name, operation).await
}
