//! # checkout-payments
//!
//! Request guards, checkout orchestration and webhook ingestion for a
//! subscription storefront billed through Stripe.
//!
//! ## Flow
//!
//! ```text
//!   browser                                               Stripe
//!      │                                                     │
//!      │  POST /checkout-session                             │
//!      ▼                                                     │
//! ┌─────────────┐    ┌──────────────────────┐   schedule,    │
//! │ Access Guard│───▶│ CheckoutOrchestrator │───invoice────▶ │
//! │ CSRF + rate │    └──────────────────────┘                │
//! └─────────────┘               │ claim                      │
//!                               ▼                            │
//!                        ┌────────────┐   mark paid,   ┌───────────────┐
//!                        │ OrderStore │◀──cancel, ─────│WebhookIngestor│◀── POST /webhook
//!                        └────────────┘   refund       └───────────────┘
//!                                                       ledger gate
//! ```
//!
//! The client pays the first invoice with the returned client secret; the
//! order only becomes `paid` when the signed webhook arrives.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use checkout_payments::{CheckoutOrchestrator, CheckoutRequest, StripeGateway};
//!
//! let gateway = Arc::new(StripeGateway::from_env()?);
//! let checkout = CheckoutOrchestrator::new(orders, analytics, gateway);
//!
//! let session = checkout.create_checkout_session(&request).await?;
//! // Hand session.client_secret to Stripe Elements
//! ```

pub mod catalog;
mod checkout;
mod error;
pub mod gateway;
pub mod guard;
pub mod webhook;

pub use catalog::{DiscountKind, LineItem, PriceQuote, Pricing};
pub use checkout::{
    AppliedDiscount, AttemptAllowance, CheckoutOrchestrator, CheckoutRequest, CheckoutSession,
    CustomerInfo, DEFAULT_ATTEMPT_LIMIT, DiscountPreview, SubmissionCheck, UNKNOWN_BUSINESS,
};
pub use error::{PaymentError, Result};
pub use gateway::{MockGateway, PaymentGateway, StripeConfig, StripeGateway};
pub use guard::{CsrfGuard, CsrfToken, LimiterFailurePolicy, RateLimiter};
pub use webhook::{SignatureVerifier, WebhookEvent, WebhookIngestor, WebhookOutcome};
