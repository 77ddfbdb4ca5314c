//! Access Guard
//!
//! Checks that run before any state-changing checkout request reaches the
//! orchestrator: a CSRF token bound to the caller's session, and a per-session
//! request window.

mod csrf;
mod rate_limit;

pub use csrf::{CSRF_HEADER, CsrfGuard, CsrfRejection, CsrfToken, DEFAULT_TOKEN_TTL_SECS, requires_csrf};
pub use rate_limit::{
    DEFAULT_LIMIT, DEFAULT_WINDOW_SECS, LimiterFailurePolicy, MemoryRateLimitStore, RateLimitDecision,
    RateLimitRecord, RateLimitStore, RateLimiter,
};
