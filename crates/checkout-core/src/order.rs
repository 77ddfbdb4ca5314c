//! Orders
//!
//! An order (a "submission" in the onboarding flow) is the customer's
//! configured purchase together with the gateway references that tie it to a
//! subscription and its payments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::session::SessionId;

/// Unique order identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payment lifecycle of an order
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Draft,
    Submitted,
    Unpaid,
    Paid,
    Refunded,
    Failed,
}

impl OrderStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Unpaid => "unpaid",
            Self::Paid => "paid",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway references written when a checkout creates a subscription
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRefs {
    pub customer_ref: String,
    pub subscription_ref: String,
    pub schedule_ref: Option<String>,
}

/// Details of a settled payment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub transaction_ref: Option<String>,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub card_last4: Option<String>,
    pub paid_at: DateTime<Utc>,
}

/// An order record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    /// Unique identifier
    pub id: OrderId,

    /// Owning onboarding session
    pub session_id: SessionId,

    /// Top-level contact email
    pub email: Option<String>,

    /// Top-level business name
    pub business_name: Option<String>,

    /// Purchased configuration as captured by the onboarding form
    #[serde(default)]
    pub form_data: serde_json::Value,

    pub status: OrderStatus,

    /// Gateway customer
    pub customer_ref: Option<String>,

    /// Active subscription; at most one per order
    pub subscription_ref: Option<String>,

    /// Commitment schedule that created the subscription
    pub schedule_ref: Option<String>,

    /// Last subscription status reported by the gateway
    pub subscription_status: Option<String>,

    /// Payment that settled the order
    pub transaction_ref: Option<String>,

    pub card_last4: Option<String>,

    /// Amount paid, minor units
    pub payment_amount: Option<i64>,

    /// ISO currency, upper case
    pub currency: Option<String>,

    pub submitted_at: Option<DateTime<Utc>>,
    pub payment_completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Create a submitted order for a session
    pub fn new(session_id: SessionId, form_data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: OrderId::new(),
            session_id,
            email: None,
            business_name: None,
            form_data,
            status: OrderStatus::Submitted,
            customer_ref: None,
            subscription_ref: None,
            schedule_ref: None,
            subscription_status: None,
            transaction_ref: None,
            card_last4: None,
            payment_amount: None,
            currency: None,
            submitted_at: Some(now),
            payment_completed_at: None,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_business_name(mut self, name: impl Into<String>) -> Self {
        self.business_name = Some(name.into());
        self
    }

    /// Whether a subscription already exists for this order
    pub const fn has_subscription(&self) -> bool {
        self.subscription_ref.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether `subscription_ref` could be tracked by this order: it has none
    /// yet, or it already tracks that one
    pub fn accepts_subscription(&self, subscription_ref: &str) -> bool {
        self.subscription_ref
            .as_deref()
            .is_none_or(|current| current == subscription_ref)
    }

    /// Record a settled payment. An order keeps the subscription it tracks.
    pub fn mark_paid(&mut self, receipt: PaymentReceipt) {
        self.status = OrderStatus::Paid;
        self.payment_completed_at = Some(receipt.paid_at);
        if receipt.transaction_ref.is_some() {
            self.transaction_ref = receipt.transaction_ref;
        }
        if receipt.customer_ref.is_some() {
            self.customer_ref = receipt.customer_ref;
        }
        if let Some(subscription_ref) = receipt.subscription_ref {
            if self.accepts_subscription(&subscription_ref) {
                self.subscription_ref = Some(subscription_ref);
            }
        }
        if receipt.amount.is_some() {
            self.payment_amount = receipt.amount;
        }
        if let Some(currency) = receipt.currency {
            self.currency = Some(currency.to_uppercase());
        }
        if receipt.card_last4.is_some() {
            self.card_last4 = receipt.card_last4;
        }
        self.touch();
    }

    pub fn mark_refunded(&mut self) {
        self.status = OrderStatus::Refunded;
        self.touch();
    }

    /// Track the gateway's view of the subscription
    pub fn attach_subscription(
        &mut self,
        subscription_ref: impl Into<String>,
        status: Option<String>,
        customer_ref: Option<String>,
        schedule_ref: Option<String>,
    ) {
        self.subscription_ref = Some(subscription_ref.into());
        if status.is_some() {
            self.subscription_status = status;
        }
        if customer_ref.is_some() {
            self.customer_ref = customer_ref;
        }
        if schedule_ref.is_some() {
            self.schedule_ref = schedule_ref;
        }
        self.touch();
    }

    /// Subscription or schedule ended; payment status is left as it was
    pub fn mark_canceled(&mut self, at: DateTime<Utc>) {
        self.subscription_status = Some("canceled".into());
        self.canceled_at = Some(at);
        self.touch();
    }
}

/// Ways to find the order a gateway object refers to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderLookup {
    Id(OrderId),
    ScheduleRef(String),
    CustomerRef(String),
    SubscriptionRef(String),
    TransactionRef(String),
}

impl OrderLookup {
    fn matches(&self, order: &Order) -> bool {
        match self {
            Self::Id(id) => &order.id == id,
            Self::ScheduleRef(r) => order.schedule_ref.as_deref() == Some(r.as_str()),
            Self::CustomerRef(r) => order.customer_ref.as_deref() == Some(r.as_str()),
            Self::SubscriptionRef(r) => order.subscription_ref.as_deref() == Some(r.as_str()),
            Self::TransactionRef(r) => order.transaction_ref.as_deref() == Some(r.as_str()),
        }
    }
}

/// Order storage
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order; fails on a duplicate id
    async fn insert(&self, order: &Order) -> Result<()>;

    /// Get order by id
    async fn get(&self, id: &OrderId) -> Result<Option<Order>>;

    /// First order matching the lookup
    async fn find(&self, lookup: &OrderLookup) -> Result<Option<Order>>;

    /// Replace an existing order
    async fn update(&self, order: &Order) -> Result<()>;

    /// Attach checkout references, but only while the order has no
    /// subscription yet. A second claim fails with `UniqueViolation`.
    async fn claim_subscription(&self, id: &OrderId, refs: &CheckoutRefs) -> Result<Order>;
}

/// In-memory order store (for development/testing)
#[derive(Default)]
pub struct MemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(StoreError::UniqueViolation(order.id.to_string()));
        }
        orders.insert(order.id.clone(), order.clone());
        Ok(())
    }

    async fn get(&self, id: &OrderId) -> Result<Option<Order>> {
        Ok(self.orders.read().await.get(id).cloned())
    }

    async fn find(&self, lookup: &OrderLookup) -> Result<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.values().find(|o| lookup.matches(o)).cloned())
    }

    async fn update(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        match orders.get_mut(&order.id) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(order.id.to_string())),
        }
    }

    async fn claim_subscription(&self, id: &OrderId, refs: &CheckoutRefs) -> Result<Order> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if let Some(existing) = &order.subscription_ref {
            return Err(StoreError::UniqueViolation(format!(
                "order {id} already holds subscription {existing}"
            )));
        }

        order.customer_ref = Some(refs.customer_ref.clone());
        order.subscription_ref = Some(refs.subscription_ref.clone());
        order.schedule_ref.clone_from(&refs.schedule_ref);
        order.touch();
        Ok(order.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(sub: &str) -> CheckoutRefs {
        CheckoutRefs {
            customer_ref: "cus_1".into(),
            subscription_ref: sub.into(),
            schedule_ref: Some("sub_sched_1".into()),
        }
    }

    #[test]
    fn test_new_order_is_submitted() {
        let order = Order::new(SessionId::new(), serde_json::json!({}));
        assert_eq!(order.status, OrderStatus::Submitted);
        assert!(order.submitted_at.is_some());
        assert!(!order.has_subscription());
    }

    #[test]
    fn test_mark_paid_keeps_existing_refs_when_receipt_is_sparse() {
        let mut order = Order::new(SessionId::new(), serde_json::json!({}));
        order.customer_ref = Some("cus_1".into());

        order.mark_paid(PaymentReceipt {
            transaction_ref: Some("pi_1".into()),
            customer_ref: None,
            subscription_ref: None,
            amount: Some(3500),
            currency: Some("eur".into()),
            card_last4: None,
            paid_at: Utc::now(),
        });

        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.customer_ref.as_deref(), Some("cus_1"));
        assert_eq!(order.transaction_ref.as_deref(), Some("pi_1"));
        assert_eq!(order.currency.as_deref(), Some("EUR"));
        assert!(order.payment_completed_at.is_some());
    }

    #[test]
    fn test_mark_paid_keeps_tracked_subscription() {
        let mut order = Order::new(SessionId::new(), serde_json::json!({}));
        order.attach_subscription("sub_A", None, Some("cus_1".into()), None);
        assert!(order.accepts_subscription("sub_A"));
        assert!(!order.accepts_subscription("sub_B"));

        order.mark_paid(PaymentReceipt {
            transaction_ref: Some("pi_2".into()),
            customer_ref: Some("cus_1".into()),
            subscription_ref: Some("sub_B".into()),
            amount: Some(3500),
            currency: Some("eur".into()),
            card_last4: None,
            paid_at: Utc::now(),
        });
        assert_eq!(order.subscription_ref.as_deref(), Some("sub_A"));

        let mut fresh = Order::new(SessionId::new(), serde_json::json!({}));
        assert!(fresh.accepts_subscription("sub_B"));
        fresh.mark_paid(PaymentReceipt {
            transaction_ref: None,
            customer_ref: None,
            subscription_ref: Some("sub_B".into()),
            amount: None,
            currency: None,
            card_last4: None,
            paid_at: Utc::now(),
        });
        assert_eq!(fresh.subscription_ref.as_deref(), Some("sub_B"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&OrderStatus::Refunded).unwrap();
        assert_eq!(json, "\"refunded\"");
    }

    #[tokio::test]
    async fn test_claim_subscription_only_once() {
        let store = MemoryOrderStore::new();
        let order = Order::new(SessionId::new(), serde_json::json!({}));
        store.insert(&order).await.unwrap();

        let claimed = store.claim_subscription(&order.id, &refs("sub_1")).await.unwrap();
        assert_eq!(claimed.subscription_ref.as_deref(), Some("sub_1"));

        let second = store.claim_subscription(&order.id, &refs("sub_2")).await;
        assert!(matches!(second, Err(StoreError::UniqueViolation(_))));
        let stored = store.get(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_ref.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn test_find_by_gateway_refs() {
        let store = MemoryOrderStore::new();
        let order = Order::new(SessionId::new(), serde_json::json!({}));
        store.insert(&order).await.unwrap();
        store.claim_subscription(&order.id, &refs("sub_9")).await.unwrap();

        let by_sub = store
            .find(&OrderLookup::SubscriptionRef("sub_9".into()))
            .await
            .unwrap();
        assert_eq!(by_sub.map(|o| o.id), Some(order.id.clone()));

        let by_schedule = store
            .find(&OrderLookup::ScheduleRef("sub_sched_1".into()))
            .await
            .unwrap();
        assert!(by_schedule.is_some());

        let missing = store
            .find(&OrderLookup::CustomerRef("cus_other".into()))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
