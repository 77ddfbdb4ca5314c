//! checkout-server
//!
//! Axum server in front of the checkout orchestrator and the Stripe webhook
//! ingestor. Stores are in-memory, so run a single instance.

mod config;
mod handlers;
mod routes;
mod state;

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use checkout_core::{MemoryAnalyticsLog, MemoryOrderStore, MemorySessionStore, MemoryWebhookLedger};
use checkout_payments::guard::MemoryRateLimitStore;
use checkout_payments::{
    CheckoutOrchestrator, CsrfGuard, PaymentGateway, RateLimiter, SignatureVerifier,
    StripeGateway, WebhookIngestor,
};

use crate::config::ServerConfig;
use crate::state::{AppState, Payments};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env()?;
    tracing::debug!(?config, "Loaded configuration");

    let orders = Arc::new(MemoryOrderStore::new());
    let sessions = Arc::new(MemorySessionStore::new());
    let ledger = Arc::new(MemoryWebhookLedger::new());
    let analytics = Arc::new(MemoryAnalyticsLog::new());

    let csrf_secret = config.csrf_secret.clone().unwrap_or_else(|| {
        tracing::warn!("CSRF_SECRET not set - tokens will not survive a restart");
        format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
    });
    let csrf = Arc::new(CsrfGuard::new(csrf_secret, config.csrf_ttl)?);

    let limiter = RateLimiter::new(
        Arc::new(MemoryRateLimitStore::new()),
        config.rate_limit,
        config.rate_window,
    )
    .with_failure_policy(config.rate_limit_failure);

    // Initialize payments
    let payments = match StripeGateway::from_env() {
        Ok(stripe) => {
            let verifier = SignatureVerifier::new(stripe.webhook_secret())?;
            let gateway: Arc<dyn PaymentGateway> = Arc::new(stripe);
            tracing::info!("✓ Stripe configured");
            Some(Arc::new(Payments {
                checkout: CheckoutOrchestrator::new(orders.clone(), analytics.clone(), gateway.clone())
                    .with_pricing(config.pricing.clone())
                    .with_attempt_limit(config.attempt_limit, chrono::Duration::hours(1)),
                webhooks: WebhookIngestor::new(
                    ledger,
                    orders.clone(),
                    analytics,
                    gateway,
                    verifier,
                )
                .with_processing_lease(config.webhook_lease),
            }))
        }
        Err(e) => {
            tracing::warn!(error = %e, "⚠ Stripe not configured - payments disabled");
            tracing::warn!("  Set STRIPE_SECRET_KEY, STRIPE_WEBHOOK_SECRET and STRIPE_BASE_PRICE_ID in .env");
            None
        }
    };

    let state = AppState {
        orders,
        sessions,
        csrf,
        limiter,
        payments,
    };

    let app = routes::router(state, config.request_timeout);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("🚀 checkout-server running on http://{}", config.bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                       - Health check");
    tracing::info!("  GET  /api/csrf-token               - Issue CSRF token");
    tracing::info!("  POST /checkout-session             - Start checkout");
    tracing::info!("  POST /api/stripe/validate-discount - Preview discount");
    tracing::info!("  GET  /api/payment/status/{{id}}      - Payment status");
    tracing::info!("  POST {}                        - Stripe webhook", routes::WEBHOOK_PATH);

    axum::serve(listener, app).await?;

    Ok(())
}
