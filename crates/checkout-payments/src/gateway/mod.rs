//! Payment Gateway
//!
//! The calls the checkout and webhook paths make against the billing
//! provider. `StripeGateway` wraps the `async-stripe` client; `MockGateway` records
//! calls in memory for tests and local runs.
//!
//! Every create call carries an idempotency key so the retry layer can repeat
//! it without creating a second object on the provider side.

mod mock;
mod stripe;

pub use mock::{GatewayCall, MockGateway};
pub use self::stripe::{StripeConfig, StripeGateway};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::catalog::DiscountKind;
use crate::error::Result;

/// Billing customer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Customer creation parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewCustomer {
    pub email: String,
    pub name: String,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

/// Coupon as the provider reports it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: String,
    pub valid: bool,
    pub percent_off: Option<f64>,
    pub amount_off: Option<i64>,
    pub currency: Option<String>,
}

impl Coupon {
    pub fn percent(id: impl Into<String>, pct: f64) -> Self {
        Self {
            id: id.into(),
            valid: true,
            percent_off: Some(pct),
            amount_off: None,
            currency: None,
        }
    }

    pub fn amount(id: impl Into<String>, amount: i64, currency: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            valid: true,
            percent_off: None,
            amount_off: Some(amount),
            currency: Some(currency.into()),
        }
    }

    /// How this coupon reduces a price; `None` for a coupon with neither field
    pub fn kind(&self) -> Option<DiscountKind> {
        self.percent_off
            .map(DiscountKind::Percent)
            .or_else(|| self.amount_off.map(DiscountKind::Amount))
    }
}

/// What a schedule does when its last phase ends
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndBehavior {
    /// Retire the schedule and keep the subscription running
    #[default]
    Release,
    Cancel,
}

impl EndBehavior {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Cancel => "cancel",
        }
    }
}

/// One schedule phase
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulePhase {
    pub price_ref: String,
    pub quantity: u32,
    pub end_date: DateTime<Utc>,
    pub coupon: Option<String>,
}

/// Subscription schedule creation parameters
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleRequest {
    pub customer_ref: String,
    pub start_date: DateTime<Utc>,
    pub end_behavior: EndBehavior,
    pub phases: Vec<SchedulePhase>,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

/// Created schedule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSchedule {
    pub id: String,
    /// Subscription started by the schedule's first phase
    pub subscription_ref: Option<String>,
    pub end_behavior: EndBehavior,
    pub phases: Vec<SchedulePhase>,
}

/// Subscription as the provider reports it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: String,
    pub customer_ref: Option<String>,
    pub schedule_ref: Option<String>,
    pub latest_invoice: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// One-time invoice item parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceItemRequest {
    pub customer_ref: String,
    pub invoice_ref: String,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    pub idempotency_key: String,
}

/// Finalized invoice
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub amount_due: i64,
    pub currency: String,
    pub status: String,
    pub payment_intent: Option<String>,
    /// Client secret of the invoice's payment intent, absent when nothing is due
    pub client_secret: Option<String>,
}

/// Billing provider operations
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>>;

    async fn create_customer(&self, customer: &NewCustomer) -> Result<Customer>;

    /// `None` when the provider has no coupon with this id
    async fn retrieve_coupon(&self, code: &str) -> Result<Option<Coupon>>;

    async fn create_subscription_schedule(&self, request: &ScheduleRequest) -> Result<SubscriptionSchedule>;

    async fn retrieve_subscription(&self, subscription_ref: &str) -> Result<Subscription>;

    async fn add_invoice_item(&self, item: &InvoiceItemRequest) -> Result<()>;

    async fn finalize_invoice(&self, invoice_ref: &str) -> Result<Invoice>;

    /// Price the base subscription is billed at
    fn base_price_ref(&self) -> &str;
}
