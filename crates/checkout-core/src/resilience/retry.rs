//! Retry with exponential backoff and multiplicative jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How a failed call failed, as far as retrying is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection refused, reset, DNS, TLS
    Network,
    /// The call did not answer in time
    Timeout,
    /// Downstream answered 5xx
    Server(u16),
    /// Downstream answered 4xx; the request itself is wrong
    Client(u16),
    /// A breaker refused the call without trying
    CircuitOpen,
    /// Anything else (validation, parsing, domain conflicts)
    Permanent,
}

impl FailureKind {
    /// Failures that say something about the health of the dependency
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Server(_))
    }
}

/// Errors that can tell the retry loop what kind of failure they are
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

/// Retry configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_delay: Duration,

    /// Ceiling applied before jitter
    pub max_delay: Duration,

    /// Growth factor between attempts
    pub backoff_multiplier: f64,

    /// Scale each delay by a random factor in [0.5, 1.0)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// Session creation, final submission, checkout gateway calls
    pub const fn critical() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(15_000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Routine reads and writes
    pub const fn standard() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5_000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Cheap lookups where a slow answer is worse than none
    pub const fn fast() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// File-bearing operations: long delays, 4xx is final
    pub const fn file_upload() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// A single attempt, no retries
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub const fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether a failure of this kind may be retried. A 4xx answer is final:
    /// repeating the same request cannot change it.
    pub const fn should_retry(&self, kind: FailureKind) -> bool {
        kind.is_transient()
    }

    /// Capped exponential delay before attempt `attempt + 1` (1-based `attempt`),
    /// without jitter.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let millis = (initial_ms * self.backoff_multiplier.powi(exponent)).min(max_ms).max(0.0);
        Duration::from_millis(millis.round() as u64)
    }

    /// Delay actually slept after a failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter {
            delay.mul_f64(0.5 + fastrand::f64() * 0.5)
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is exhausted.
///
/// Only bounded `tokio::time::sleep`s happen between attempts, so dropping the
/// returned future (request timeout, client disconnect) cancels the loop at once.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                let kind = e.failure_kind();
                if attempt >= max_attempts || !policy.should_retry(kind) {
                    if attempt > 1 {
                        tracing::warn!(operation, attempt, error = %e, "Giving up after retries");
                    }
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    kind = ?kind,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
