//! Session Rate Limiting
//!
//! Fixed window per key: the first hit opens a window ending at
//! `now + window`, later hits count against it, and a full window rejects
//! without moving `reset_at`. Expired windows are reclaimed lazily.
//!
//! The in-memory store only limits a single instance. Several instances need a
//! shared `RateLimitStore` with an atomic check-and-increment.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use checkout_core::StoreError;

/// Default attempts per window
pub const DEFAULT_LIMIT: u32 = 5;

/// Default window length
pub const DEFAULT_WINDOW_SECS: i64 = 3600;

/// Sweep expired windows every this many hits
const SWEEP_EVERY: u64 = 256;

/// Window state for one key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// Outcome of one hit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Window storage. `hit` must check and increment atomically.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError>;
}

/// Apply one hit to a window record
fn apply_hit(record: Option<&mut RateLimitRecord>, limit: u32, window: Duration, now: DateTime<Utc>) -> (RateLimitDecision, Option<RateLimitRecord>) {
    match record {
        Some(record) if now < record.reset_at => {
            if record.count >= limit {
                let decision = RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at: record.reset_at,
                };
                return (decision, None);
            }
            record.count += 1;
            let decision = RateLimitDecision {
                allowed: true,
                remaining: limit - record.count,
                reset_at: record.reset_at,
            };
            (decision, None)
        }
        _ => {
            let fresh = RateLimitRecord {
                count: 1,
                reset_at: now + window,
            };
            let decision = RateLimitDecision {
                allowed: limit > 0,
                remaining: limit.saturating_sub(1),
                reset_at: fresh.reset_at,
            };
            (decision, Some(fresh))
        }
    }
}

#[derive(Default)]
struct Windows {
    records: HashMap<String, RateLimitRecord>,
    hits: u64,
}

/// In-memory window store (single instance)
#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: Mutex<Windows>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live windows
    pub async fn len(&self) -> usize {
        self.windows.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.windows.lock().await.records.is_empty()
    }

    /// Drop every expired window
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut windows = self.windows.lock().await;
        let before = windows.records.len();
        windows.records.retain(|_, r| now < r.reset_at);
        before - windows.records.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, StoreError> {
        let mut windows = self.windows.lock().await;
        windows.hits += 1;
        if windows.hits % SWEEP_EVERY == 0 {
            windows.records.retain(|_, r| now < r.reset_at);
        }

        let (decision, fresh) = apply_hit(windows.records.get_mut(key), limit, window, now);
        if let Some(record) = fresh {
            windows.records.insert(key.to_string(), record);
        }
        Ok(decision)
    }
}

/// What to do when the window store cannot answer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterFailurePolicy {
    /// Admit the request
    FailOpen,
    /// Reject the request
    #[default]
    FailClosed,
}

impl std::str::FromStr for LimiterFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "fail_open" | "fail-open" => Ok(Self::FailOpen),
            "closed" | "fail_closed" | "fail-closed" => Ok(Self::FailClosed),
            other => Err(format!("unknown limiter failure policy: {other}")),
        }
    }
}

/// Per-session limiter over a window store
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    limit: u32,
    window: Duration,
    on_store_error: LimiterFailurePolicy,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("on_store_error", &self.on_store_error)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
            on_store_error: LimiterFailurePolicy::default(),
        }
    }

    /// In-memory limiter with the default 5 per hour
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRateLimitStore::new()),
            DEFAULT_LIMIT,
            Duration::seconds(DEFAULT_WINDOW_SECS),
        )
    }

    pub const fn with_failure_policy(mut self, policy: LimiterFailurePolicy) -> Self {
        self.on_store_error = policy;
        self
    }

    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one request for `session_id`
    pub async fn check(&self, session_id: &str) -> RateLimitDecision {
        self.check_at(session_id, Utc::now()).await
    }

    pub async fn check_at(&self, session_id: &str, now: DateTime<Utc>) -> RateLimitDecision {
        match self.store.hit(session_id, self.limit, self.window, now).await {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::warn!(
                        session_id,
                        reset_at = %decision.reset_at,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => {
                let allowed = self.on_store_error == LimiterFailurePolicy::FailOpen;
                tracing::error!(
                    session_id,
                    error = %e,
                    allowed,
                    "Rate limit store unavailable"
                );
                RateLimitDecision {
                    allowed,
                    remaining: if allowed { self.limit } else { 0 },
                    reset_at: now + self.window,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn hit(
            &self,
            _key: &str,
            _limit: u32,
            _window: Duration,
            _now: DateTime<Utc>,
        ) -> Result<RateLimitDecision, StoreError> {
            Err(StoreError::Unavailable("cache down".into()))
        }
    }

    #[tokio::test]
    async fn test_sixth_request_in_window_is_rejected() {
        let limiter = RateLimiter::in_memory();
        let now = Utc::now();

        let first = limiter.check_at("s", now).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 4);
        assert_eq!(first.reset_at, now + Duration::hours(1));

        for i in 2..=5u32 {
            let d = limiter.check_at("s", now + Duration::minutes(i64::from(i))).await;
            assert!(d.allowed, "request {i} should pass");
            assert_eq!(d.remaining, 5 - i);
            assert_eq!(d.reset_at, first.reset_at);
        }

        let sixth = limiter.check_at("s", now + Duration::minutes(30)).await;
        assert!(!sixth.allowed);
        assert_eq!(sixth.reset_at, first.reset_at, "rejection must not extend the window");
    }

    #[tokio::test]
    async fn test_window_resets_after_expiry() {
        let limiter = RateLimiter::in_memory();
        let now = Utc::now();
        for _ in 0..6 {
            limiter.check_at("s", now).await;
        }
        let later = now + Duration::hours(1);
        let d = limiter.check_at("s", later).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 4);
        assert_eq!(d.reset_at, later + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_sessions_are_limited_independently() {
        let limiter = RateLimiter::in_memory();
        let now = Utc::now();
        for _ in 0..5 {
            limiter.check_at("a", now).await;
        }
        assert!(!limiter.check_at("a", now).await.allowed);
        assert!(limiter.check_at("b", now).await.allowed);
    }

    #[tokio::test]
    async fn test_expired_windows_are_reclaimed() {
        let store = MemoryRateLimitStore::new();
        let now = Utc::now();
        store.hit("a", 5, Duration::hours(1), now).await.unwrap();
        store.hit("b", 5, Duration::minutes(1), now).await.unwrap();

        assert_eq!(store.purge_expired(now + Duration::minutes(2)).await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed_by_default() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), 5, Duration::hours(1));
        let decision = limiter.check("s").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_store_failure_can_fail_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), 5, Duration::hours(1))
            .with_failure_policy(LimiterFailurePolicy::FailOpen);
        let decision = limiter.check("s").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
    }

    #[test]
    fn test_failure_policy_parses() {
        assert_eq!("open".parse::<LimiterFailurePolicy>(), Ok(LimiterFailurePolicy::FailOpen));
        assert_eq!("fail_closed".parse::<LimiterFailurePolicy>(), Ok(LimiterFailurePolicy::FailClosed));
        assert!("maybe".parse::<LimiterFailurePolicy>().is_err());
    }
}
