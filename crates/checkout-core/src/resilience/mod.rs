//! Resilience Kit
//!
//! Retry and circuit breaking, composed into a decorator that wraps any call
//! to an external dependency:
//!
//! ```text
//! caller ──▶ Resilient::call ──▶ retry loop ──▶ breaker.allow() ──▶ operation
//!                                    ▲                                  │
//!                                    └──── backoff + jitter ◀── transient failure
//! ```
//!
//! Each logical dependency (payment gateway, datastore, analytics log) owns its
//! own breaker, so one failing dependency cannot starve calls to the others.

mod breaker;
mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitOpen, CircuitState, Permit};
pub use retry::{Classify, FailureKind, RetryPolicy, retry};

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy plus breaker for one dependency
#[derive(Clone, Debug)]
pub struct Resilient {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl Resilient {
    pub fn new(dependency: &'static str, policy: RetryPolicy, breaker: BreakerConfig) -> Self {
        Self {
            policy,
            breaker: Arc::new(CircuitBreaker::new(dependency, breaker)),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Same breaker, different retry policy
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            policy,
            breaker: Arc::clone(&self.breaker),
        }
    }

    /// Call through the breaker with retries
    pub async fn call<T, E, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display + From<CircuitOpen>,
    {
        let breaker = &self.breaker;
        retry(&self.policy, operation, || {
            let attempt = breaker.allow().map(|permit| (permit, f()));
            async move {
                let (permit, fut) = attempt?;
                guarded(permit, fut).await
            }
        })
        .await
    }

    /// Call through the breaker exactly once. For writes whose retry could
    /// observe their own first attempt (unique inserts).
    pub async fn call_once<T, E, Fut>(&self, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<CircuitOpen>,
    {
        let permit = self.breaker.allow()?;
        guarded(permit, fut).await
    }

    /// Retry without consulting or feeding the breaker. For bookkeeping writes
    /// that must still land while the breaker is open on the same dependency.
    pub async fn call_without_breaker<T, E, F, Fut>(&self, operation: &str, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        retry(&self.policy, operation, f).await
    }
}

/// Runs one attempt and settles its permit. If the future is dropped first,
/// the permit's own drop releases a half-open trial.
async fn guarded<T, E, Fut>(permit: Permit<'_>, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
{
    let result = fut.await;
    match &result {
        Ok(_) => permit.success(),
        Err(e) if e.failure_kind().is_transient() => permit.failure(),
        // A definitive answer still proves the dependency is up.
        Err(_) => permit.success(),
    }
    result
}

/// Independent breakers per logical dependency
#[derive(Clone, Debug)]
pub struct ResilienceKit {
    pub gateway: Resilient,
    pub datastore: Resilient,
    pub analytics: Resilient,
}

impl Default for ResilienceKit {
    fn default() -> Self {
        Self {
            gateway: Resilient::new(
                "gateway",
                RetryPolicy::critical(),
                BreakerConfig::new(5, Duration::from_secs(60)),
            ),
            datastore: Resilient::new(
                "datastore",
                RetryPolicy::standard(),
                BreakerConfig::new(3, Duration::from_secs(120)),
            ),
            analytics: Resilient::new(
                "analytics",
                RetryPolicy::fast(),
                BreakerConfig::new(5, Duration::from_secs(30)),
            ),
        }
    }
}

impl ResilienceKit {
    /// Single attempts with tiny breakers; keeps tests fast and deterministic
    pub fn for_tests() -> Self {
        let breaker = BreakerConfig::new(100, Duration::from_millis(10));
        Self {
            gateway: Resilient::new("gateway", RetryPolicy::none(), breaker.clone()),
            datastore: Resilient::new("datastore", RetryPolicy::none(), breaker.clone()),
            analytics: Resilient::new("analytics", RetryPolicy::none(), breaker),
        }
    }
}
