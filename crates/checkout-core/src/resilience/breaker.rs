//! Circuit Breaker
//!
//! Trips open after a run of consecutive transient failures, refuses calls for
//! a cooldown, then lets a single trial call through to decide whether to close again.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

/// Returned instead of calling a dependency whose breaker is open
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker for {dependency} is open")]
pub struct CircuitOpen {
    pub dependency: &'static str,
}

/// Breaker configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// How long the circuit stays open before a trial call
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    pub const fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self { failure_threshold, cooldown }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-dependency circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(dependency: &'static str, config: BreakerConfig) -> Self {
        Self {
            dependency,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub const fn dependency(&self) -> &'static str {
        self.dependency
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is a handful of plain fields; a panic mid-update cannot leave it unusable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, promoting Open to HalfOpen once the cooldown has passed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = false;
                }
            }
        }
    }

    /// Ask permission to make a call. The permit must be settled with
    /// [`Permit::success`] or [`Permit::failure`]; a half-open trial whose
    /// permit is dropped unsettled counts as a failed trial.
    pub fn allow(&self) -> Result<Permit<'_>, CircuitOpen> {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                tracing::info!(dependency = self.dependency, "Circuit half-open, letting a trial call through");
                Ok(Permit::new(self, true))
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(CircuitOpen {
                dependency: self.dependency,
            }),
        }
    }

    /// The dependency answered (possibly with a definitive client error)
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(dependency = self.dependency, "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// The dependency failed transiently
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;

        if trip {
            if inner.state != CircuitState::Open {
                tracing::warn!(
                    dependency = self.dependency,
                    failures = inner.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
        }
    }

    /// A trial call went away without an answer; reopen for another cooldown
    fn abandon_trial(&self) {
        let abandoned = {
            let inner = self.lock();
            inner.state == CircuitState::HalfOpen && inner.trial_in_flight
        };
        if abandoned {
            tracing::warn!(dependency = self.dependency, "Circuit trial call abandoned before completing");
            self.record_failure();
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn reset(&self) {
        self.record_success();
    }
}

/// Permission for one call through a [`CircuitBreaker`]
#[must_use = "settle the permit with success() or failure()"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    const fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this call is the half-open trial call
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}
