//! Application State

use std::sync::Arc;

use checkout_core::{OrderStore, SessionStore};
use checkout_payments::{CheckoutOrchestrator, CsrfGuard, RateLimiter, WebhookIngestor};

/// Gateway-backed services; absent when Stripe is not configured
pub struct Payments {
    pub checkout: CheckoutOrchestrator,
    pub webhooks: WebhookIngestor,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Order records (payment status polling)
    pub orders: Arc<dyn OrderStore>,

    /// Onboarding sessions, read to issue CSRF tokens
    pub sessions: Arc<dyn SessionStore>,

    pub csrf: Arc<CsrfGuard>,

    /// Per-session limiter for guarded routes
    pub limiter: RateLimiter,

    pub payments: Option<Arc<Payments>>,
}
