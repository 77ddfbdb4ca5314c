//! # checkout-core
//!
//! Domain records, datastore contracts and resilience primitives shared by the
//! checkout orchestrator and the webhook ingestor.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       checkout-core                           │
//! │  ┌────────────┐  ┌────────────────┐  ┌─────────────────────┐ │
//! │  │   Order    │  │ WebhookLedger  │  │   ResilienceKit     │ │
//! │  │  Session   │  │ (unique event  │  │ retry + breaker per │ │
//! │  │ Analytics  │  │      ids)      │  │     dependency      │ │
//! │  └────────────┘  └────────────────┘  └─────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Storage is reached only through the `OrderStore`, `WebhookLedger`,
//! `SessionStore` and `AnalyticsLog` traits. The in-memory implementations
//! serve single-instance deployments and tests; anything relational or
//! strongly consistent that can enforce a unique key satisfies the contract.

pub mod analytics;
pub mod error;
pub mod ledger;
pub mod order;
pub mod resilience;
pub mod session;

pub use analytics::{AnalyticsEvent, AnalyticsEventType, AnalyticsLog, MemoryAnalyticsLog};
pub use error::{Result, StoreError};
pub use ledger::{LedgerStatus, MemoryWebhookLedger, WebhookEventRecord, WebhookLedger};
pub use order::{
    CheckoutRefs, MemoryOrderStore, Order, OrderId, OrderLookup, OrderStatus, OrderStore,
    PaymentReceipt,
};
pub use resilience::{
    BreakerConfig, CircuitBreaker, CircuitOpen, CircuitState, Classify, FailureKind, Permit,
    ResilienceKit, Resilient, RetryPolicy,
};
pub use session::{MemorySessionStore, Session, SessionId, SessionStore};
