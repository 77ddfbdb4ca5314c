//! Checkout Orchestrator
//!
//! Turns a submitted order into a committed subscription:
//!
//! ```text
//! validate order ─▶ validate add-ons ─▶ attempt limit ─▶ log attempt
//!       │                                                    │
//!   not found / already paid                                  ▼
//!                      claim order ◀─ finalize ◀─ add-ons ◀─ schedule ◀─ coupon ◀─ customer
//! ```
//!
//! Gateway calls go through the gateway breaker with the critical retry
//! policy; create calls carry idempotency keys scoped to this attempt, so a
//! retried call never creates a second customer or schedule. The order is
//! claimed with a compare-and-set at the end, which closes the window between
//! the early "already has a subscription" check and the write.

use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use checkout_core::{
    AnalyticsEvent, AnalyticsEventType, AnalyticsLog, CheckoutRefs, Order, OrderId, OrderStore,
    ResilienceKit, SessionId, StoreError,
};

use crate::catalog::{COMMITMENT_MONTHS, DiscountKind, LineItem, Pricing};
use crate::error::{PaymentError, Result};
use crate::gateway::{
    EndBehavior, InvoiceItemRequest, NewCustomer, PaymentGateway, SchedulePhase, ScheduleRequest,
};
use crate::guard::LimiterFailurePolicy;

/// Placeholder when an order carries no business name
pub const UNKNOWN_BUSINESS: &str = "Unknown Business";

/// Checkout attempts allowed per session and window
pub const DEFAULT_ATTEMPT_LIMIT: u32 = 5;

/// Length of the commitment phase
const COMMITMENT_DAYS: i64 = 365;

/// Request to start checkout for an order
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Order to pay for
    #[serde(alias = "submission_id")]
    pub order_id: OrderId,

    /// Add-on language codes
    #[serde(default, alias = "additional_languages")]
    pub language_codes: Vec<String>,

    #[serde(default)]
    pub discount_code: Option<String>,

    /// Where the client returns after paying
    #[serde(default)]
    pub success_url: Option<String>,

    /// Where the client returns after abandoning
    #[serde(default)]
    pub cancel_url: Option<String>,
}

/// A discount that was applied to the first invoice
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub code: String,
    pub amount: i64,
}

/// Result of a successful checkout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutSession {
    /// Client secret for confirming payment; absent when nothing is due
    pub client_secret: Option<String>,
    pub customer_ref: String,
    pub subscription_ref: String,
    pub schedule_ref: String,
    pub invoice_ref: String,
    pub amount_due: i64,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub discount_applied: Option<AppliedDiscount>,
}

/// Outcome of looking an order up for checkout
#[derive(Clone, Debug)]
pub struct SubmissionCheck {
    pub order: Order,
    /// The order already holds a subscription and must not be charged again
    pub existing_subscription: bool,
}

/// Who gets billed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub email: String,
    pub business_name: String,
}

/// Checkout attempts left for a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptAllowance {
    pub allowed: bool,
    pub attempts_remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Discount preview against the base fee
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscountPreview {
    pub code: String,
    /// Reduction, minor units
    pub amount: i64,
    pub kind: DiscountKind,
}

/// Checkout orchestrator
pub struct CheckoutOrchestrator {
    orders: Arc<dyn OrderStore>,
    analytics: Arc<dyn AnalyticsLog>,
    gateway: Arc<dyn PaymentGateway>,
    resilience: ResilienceKit,
    pricing: Pricing,
    attempt_limit: u32,
    attempt_window: Duration,
    on_count_error: LimiterFailurePolicy,
}

impl CheckoutOrchestrator {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        analytics: Arc<dyn AnalyticsLog>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            orders,
            analytics,
            gateway,
            resilience: ResilienceKit::default(),
            pricing: Pricing::default(),
            attempt_limit: DEFAULT_ATTEMPT_LIMIT,
            attempt_window: Duration::hours(1),
            on_count_error: LimiterFailurePolicy::FailOpen,
        }
    }

    pub fn with_resilience(mut self, resilience: ResilienceKit) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub const fn with_attempt_limit(mut self, limit: u32, window: Duration) -> Self {
        self.attempt_limit = limit;
        self.attempt_window = window;
        self
    }

    /// What to do when attempts cannot be counted
    pub const fn with_count_failure_policy(mut self, policy: LimiterFailurePolicy) -> Self {
        self.on_count_error = policy;
        self
    }

    pub const fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    /// Look up an order and flag one that already has a subscription
    pub async fn validate_submission(&self, order_id: &OrderId) -> Result<SubmissionCheck> {
        let order = self
            .resilience
            .datastore
            .call("get_order", || async {
                self.orders.get(order_id).await.map_err(PaymentError::from)
            })
            .await?
            .ok_or_else(|| PaymentError::InvalidSubmission(order_id.to_string()))?;

        Ok(SubmissionCheck {
            existing_subscription: order.has_subscription(),
            order,
        })
    }

    /// Codes outside the add-on catalog
    pub fn validate_language_codes<S: AsRef<str>>(&self, codes: &[S]) -> Vec<String> {
        crate::catalog::validate_language_codes(codes)
    }

    /// Count recent attempts for a session
    pub async fn check_rate_limit(&self, session_id: &SessionId) -> AttemptAllowance {
        let now = Utc::now();
        let reset_at = now + self.attempt_window;
        let since = now - self.attempt_window;

        let counted = self
            .resilience
            .analytics
            .call("count_attempts", || async {
                self.analytics
                    .count_since(session_id, AnalyticsEventType::PaymentAttempt, since)
                    .await
                    .map_err(PaymentError::from)
            })
            .await;

        match counted {
            Ok(count) => {
                let used = u32::try_from(count).unwrap_or(u32::MAX);
                let allowed = used < self.attempt_limit;
                AttemptAllowance {
                    allowed,
                    attempts_remaining: if allowed { self.attempt_limit - used } else { 0 },
                    reset_at,
                }
            }
            Err(e) => {
                let allowed = self.on_count_error == LimiterFailurePolicy::FailOpen;
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    allowed,
                    "Could not count checkout attempts"
                );
                // Failing open grants a full window, since nothing was counted.
                AttemptAllowance {
                    allowed,
                    attempts_remaining: if allowed { self.attempt_limit } else { 0 },
                    reset_at,
                }
            }
        }
    }

    /// Billing email and display name for an order
    pub fn extract_customer_info(&self, order: &Order) -> Result<CustomerInfo> {
        let form = &order.form_data;
        let field = |path: &[&str]| {
            path.iter()
                .try_fold(form, |value, key| value.get(key))
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let top_level = |value: Option<&String>| {
            value
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let email = field(&["email"])
            .or_else(|| field(&["businessEmail"]))
            .or_else(|| field(&["step3", "businessEmail"]))
            .or_else(|| top_level(order.email.as_ref()))
            .ok_or(PaymentError::MissingCustomerEmail)?;

        let business_name = field(&["businessName"])
            .or_else(|| field(&["step3", "businessName"]))
            .or_else(|| top_level(order.business_name.as_ref()))
            .unwrap_or_else(|| UNKNOWN_BUSINESS.to_string());

        Ok(CustomerInfo { email, business_name })
    }

    /// Check a coupon with the gateway and price it against the base fee
    pub async fn validate_discount(&self, code: &str) -> Result<DiscountPreview> {
        let code = code.trim();
        let coupon = self
            .resilience
            .gateway
            .call("retrieve_coupon", || self.gateway.retrieve_coupon(code))
            .await?
            .filter(|c| c.valid)
            .ok_or_else(|| PaymentError::InvalidDiscountCode(code.to_string()))?;
        let kind = coupon
            .kind()
            .ok_or_else(|| PaymentError::InvalidDiscountCode(code.to_string()))?;

        Ok(DiscountPreview {
            code: coupon.id,
            amount: kind.amount_off(self.pricing.base_fee),
            kind,
        })
    }

    /// Run a full checkout for an order
    pub async fn create_checkout_session(&self, request: &CheckoutRequest) -> Result<CheckoutSession> {
        let check = self.validate_submission(&request.order_id).await?;
        if check.existing_subscription {
            tracing::info!(
                order_id = %request.order_id,
                subscription_ref = ?check.order.subscription_ref,
                "Checkout refused, order already has a subscription"
            );
            return Err(PaymentError::AlreadyPaid(request.order_id.to_string()));
        }
        let order = check.order;

        let invalid = self.validate_language_codes(&request.language_codes);
        if !invalid.is_empty() {
            return Err(PaymentError::InvalidLanguageCodes(invalid));
        }

        let allowance = self.check_rate_limit(&order.session_id).await;
        if !allowance.allowed {
            return Err(PaymentError::RateLimited {
                reset_at: allowance.reset_at,
            });
        }

        self.record(
            AnalyticsEvent::new(
                AnalyticsEventType::PaymentAttempt,
                serde_json::json!({
                    "submission_id": order.id,
                    "language_count": request.language_codes.len(),
                    "discount_code": request.discount_code,
                    "success_url": request.success_url,
                    "cancel_url": request.cancel_url,
                }),
            )
            .for_session(order.session_id.clone()),
        )
        .await;

        let customer_info = self.extract_customer_info(&order)?;
        let attempt = Uuid::new_v4().simple().to_string();
        let idempotency = |step: &str| format!("checkout:{}:{attempt}:{step}", order.id);

        let customer_ref = self
            .find_or_create_customer(&order, &customer_info, idempotency("customer"))
            .await?;

        let discount_code = request
            .discount_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let discount = match discount_code {
            Some(code) => Some(self.validate_discount(code).await?),
            None => None,
        };

        let quote = self.pricing.quote(&request.language_codes);
        let now = Utc::now();
        let schedule_request = ScheduleRequest {
            customer_ref: customer_ref.clone(),
            start_date: now,
            end_behavior: EndBehavior::Release,
            phases: vec![SchedulePhase {
                price_ref: self.gateway.base_price_ref().to_string(),
                quantity: 1,
                end_date: now + Duration::days(COMMITMENT_DAYS),
                coupon: discount.as_ref().map(|d| d.code.clone()),
            }],
            metadata: BTreeMap::from([
                ("submission_id".to_string(), order.id.to_string()),
                ("session_id".to_string(), order.session_id.to_string()),
                ("commitment_months".to_string(), COMMITMENT_MONTHS.to_string()),
            ]),
            idempotency_key: idempotency("schedule"),
        };

        let schedule = self
            .resilience
            .gateway
            .call("create_subscription_schedule", || {
                self.gateway.create_subscription_schedule(&schedule_request)
            })
            .await?;
        let subscription_ref = schedule.subscription_ref.clone().ok_or_else(|| PaymentError::Gateway {
            operation: "create_subscription_schedule".into(),
            status: None,
            code: None,
            message: format!("schedule {} started no subscription", schedule.id),
        })?;

        let subscription = self
            .resilience
            .gateway
            .call("retrieve_subscription", || {
                self.gateway.retrieve_subscription(&subscription_ref)
            })
            .await?;
        let invoice_ref = subscription.latest_invoice.ok_or_else(|| PaymentError::Gateway {
            operation: "retrieve_subscription".into(),
            status: None,
            code: None,
            message: format!("subscription {subscription_ref} has no invoice"),
        })?;

        let items: Vec<InvoiceItemRequest> = quote
            .addons()
            .enumerate()
            .map(|(i, item)| {
                let code = item.code.clone().unwrap_or_default();
                InvoiceItemRequest {
                    customer_ref: customer_ref.clone(),
                    invoice_ref: invoice_ref.clone(),
                    amount: item.unit_amount,
                    currency: quote.currency.clone(),
                    description: item.description.clone(),
                    idempotency_key: idempotency(&format!("item:{i}:{code}")),
                    metadata: BTreeMap::from([
                        ("language_code".to_string(), code),
                        ("one_time".to_string(), "true".to_string()),
                    ]),
                }
            })
            .collect();
        try_join_all(items.iter().map(|item| {
            self.resilience
                .gateway
                .call("add_invoice_item", move || self.gateway.add_invoice_item(item))
        }))
        .await?;

        let invoice = self
            .resilience
            .gateway
            .call("finalize_invoice", || self.gateway.finalize_invoice(&invoice_ref))
            .await?;
        let client_secret = if invoice.amount_due > 0 {
            Some(invoice.client_secret.clone().ok_or_else(|| PaymentError::Gateway {
                operation: "finalize_invoice".into(),
                status: None,
                code: None,
                message: format!("invoice {} has no client secret", invoice.id),
            })?)
        } else {
            tracing::info!(
                order_id = %order.id,
                invoice_ref = %invoice.id,
                "Nothing due, invoice settled by the gateway"
            );
            None
        };

        let refs = CheckoutRefs {
            customer_ref: customer_ref.clone(),
            subscription_ref: subscription_ref.clone(),
            schedule_ref: Some(schedule.id.clone()),
        };
        self.claim(&order.id, &refs).await?;

        tracing::info!(
            order_id = %order.id,
            customer_ref = %customer_ref,
            subscription_ref = %subscription_ref,
            schedule_ref = %schedule.id,
            amount_due = invoice.amount_due,
            "Checkout session created"
        );

        Ok(CheckoutSession {
            client_secret,
            customer_ref,
            subscription_ref,
            schedule_ref: schedule.id,
            invoice_ref: invoice.id,
            amount_due: invoice.amount_due,
            currency: invoice.currency,
            line_items: quote.line_items,
            discount_applied: discount.map(|d| AppliedDiscount {
                code: d.code,
                amount: d.amount,
            }),
        })
    }

    async fn find_or_create_customer(
        &self,
        order: &Order,
        info: &CustomerInfo,
        idempotency_key: String,
    ) -> Result<String> {
        let existing = self
            .resilience
            .gateway
            .call("find_customer_by_email", || {
                self.gateway.find_customer_by_email(&info.email)
            })
            .await?;
        if let Some(customer) = existing {
            tracing::debug!(customer_ref = %customer.id, "Reusing existing customer");
            return Ok(customer.id);
        }

        let new_customer = NewCustomer {
            email: info.email.clone(),
            name: info.business_name.clone(),
            metadata: BTreeMap::from([
                ("submission_id".to_string(), order.id.to_string()),
                ("session_id".to_string(), order.session_id.to_string()),
            ]),
            idempotency_key,
        };
        let customer = self
            .resilience
            .gateway
            .call("create_customer", || self.gateway.create_customer(&new_customer))
            .await?;
        Ok(customer.id)
    }

    /// Attach the refs unless another checkout got there first
    async fn claim(&self, order_id: &OrderId, refs: &CheckoutRefs) -> Result<()> {
        let claimed = self
            .resilience
            .datastore
            .call_once(async {
                self.orders
                    .claim_subscription(order_id, refs)
                    .await
                    .map_err(PaymentError::from)
            })
            .await;

        match claimed {
            Ok(_) => Ok(()),
            Err(PaymentError::Storage(StoreError::UniqueViolation(detail))) => {
                // The losing schedule's invoice was never handed to the client.
                tracing::error!(
                    order_id = %order_id,
                    orphan_subscription_ref = %refs.subscription_ref,
                    orphan_schedule_ref = ?refs.schedule_ref,
                    detail = %detail,
                    "Concurrent checkout claimed the order first"
                );
                Err(PaymentError::AlreadyPaid(order_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn record(&self, event: AnalyticsEvent) {
        let event_type = event.event_type;
        let result = self
            .resilience
            .analytics
            .call_once(async { self.analytics.record(event).await.map_err(PaymentError::from) })
            .await;
        if let Err(e) = result {
            tracing::warn!(event_type = event_type.as_str(), error = %e, "Analytics write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ADDON_FEE, BASE_FEE};
    use crate::gateway::{Coupon, Customer, MockGateway};
    use async_trait::async_trait;
    use checkout_core::{MemoryAnalyticsLog, MemoryOrderStore, OrderStatus};
    use serde_json::json;

    struct Harness {
        orders: Arc<MemoryOrderStore>,
        analytics: Arc<MemoryAnalyticsLog>,
        gateway: Arc<MockGateway>,
        checkout: CheckoutOrchestrator,
    }

    fn harness_with(gateway: MockGateway) -> Harness {
        let orders = Arc::new(MemoryOrderStore::new());
        let analytics = Arc::new(MemoryAnalyticsLog::new());
        let gateway = Arc::new(gateway);
        let checkout = CheckoutOrchestrator::new(orders.clone(), analytics.clone(), gateway.clone())
            .with_resilience(ResilienceKit::for_tests());
        Harness {
            orders,
            analytics,
            gateway,
            checkout,
        }
    }

    fn harness() -> Harness {
        harness_with(MockGateway::new())
    }

    async fn submitted_order(h: &Harness, session: &SessionId) -> Order {
        let order = Order::new(
            session.clone(),
            json!({"businessEmail": "owner@example.com", "businessName": "Bakery Jansen"}),
        );
        h.orders.insert(&order).await.unwrap();
        order
    }

    fn request(order: &Order, codes: &[&str], discount: Option<&str>) -> CheckoutRequest {
        CheckoutRequest {
            order_id: order.id.clone(),
            language_codes: codes.iter().map(|c| (*c).to_string()).collect(),
            discount_code: discount.map(str::to_string),
            success_url: None,
            cancel_url: None,
        }
    }

    #[tokio::test]
    async fn test_base_only_checkout_schedules_one_release_phase() {
        let h = harness();
        let order = submitted_order(&h, &SessionId::new()).await;

        let session = h.checkout.create_checkout_session(&request(&order, &[], None)).await.unwrap();

        assert_eq!(session.amount_due, BASE_FEE);
        assert!(session.client_secret.is_some());
        assert_eq!(session.currency, "EUR");

        let schedules = h.gateway.schedule_requests();
        assert_eq!(schedules.len(), 1);
        let schedule = &schedules[0];
        assert_eq!(schedule.end_behavior, EndBehavior::Release);
        assert_eq!(schedule.phases.len(), 1);
        let term = schedule.phases[0].end_date - Utc::now();
        assert!((term - Duration::days(365)).num_seconds().abs() <= 86_400);
        assert_eq!(schedule.metadata.get("commitment_months").map(String::as_str), Some("12"));

        let stored = h.orders.get(&order.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription_ref.as_deref(), Some(session.subscription_ref.as_str()));
        assert_eq!(stored.schedule_ref.as_deref(), Some(session.schedule_ref.as_str()));
        assert_eq!(stored.customer_ref.as_deref(), Some(session.customer_ref.as_str()));
    }

    #[tokio::test]
    async fn test_three_addons_are_invoiced_once_each() {
        let h = harness();
        let order = submitted_order(&h, &SessionId::new()).await;

        let session = h
            .checkout
            .create_checkout_session(&request(&order, &["nl", "fr", "de"], None))
            .await
            .unwrap();

        assert_eq!(session.amount_due, BASE_FEE + 3 * ADDON_FEE);
        assert_eq!(session.line_items.len(), 4);
        assert_eq!(h.gateway.count("add_invoice_item"), 3);
    }

    #[tokio::test]
    async fn test_existing_subscription_makes_no_gateway_call() {
        let h = harness();
        let mut order = submitted_order(&h, &SessionId::new()).await;
        order.subscription_ref = Some("sub_existing".into());
        h.orders.update(&order).await.unwrap();

        let err = h
            .checkout
            .create_checkout_session(&request(&order, &["fr"], None))
            .await
            .unwrap_err();

        assert!(matches!(err, PaymentError::AlreadyPaid(_)));
        assert_eq!(err.status(), 409);
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_second_checkout_for_same_order_is_a_conflict() {
        let h = harness();
        let order = submitted_order(&h, &SessionId::new()).await;
        h.checkout.create_checkout_session(&request(&order, &[], None)).await.unwrap();
        let calls = h.gateway.calls().len();

        let err = h.checkout.create_checkout_session(&request(&order, &[], None)).await.unwrap_err();
        assert!(matches!(err, PaymentError::AlreadyPaid(_)));
        assert_eq!(h.gateway.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_unknown_discount_aborts_without_subscription() {
        let h = harness();
        let order = submitted_order(&h, &SessionId::new()).await;

        let err = h
            .checkout
            .create_checkout_session(&request(&order, &[], Some("NOPE")))
            .await
            .unwrap_err();

        assert!(matches!(err, PaymentError::InvalidDiscountCode(ref c) if c == "NOPE"));
        assert_eq!(h.gateway.count("create_subscription_schedule"), 0);
        let stored = h.orders.get(&order.id).await.unwrap().unwrap();
        assert!(stored.subscription_ref.is_none());
    }

    #[tokio::test]
    async fn test_expired_coupon_is_invalid() {
        let mut coupon = Coupon::percent("OLD", 20.0);
        coupon.valid = false;
        let h = harness_with(MockGateway::new().with_coupon(coupon));
        let order = submitted_order(&h, &SessionId::new()).await;

        let err = h
            .checkout
            .create_checkout_session(&request(&order, &[], Some("OLD")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_DISCOUNT_CODE");
    }

    #[tokio::test]
    async fn test_discount_is_applied_to_schedule_and_reported() {
        let h = harness_with(MockGateway::new().with_coupon(Coupon::percent("WELCOME10", 10.0)));
        let order = submitted_order(&h, &SessionId::new()).await;

        let session = h
            .checkout
            .create_checkout_session(&request(&order, &["es"], Some(" WELCOME10 ")))
            .await
            .unwrap();

        assert_eq!(
            session.discount_applied,
            Some(AppliedDiscount {
                code: "WELCOME10".into(),
                amount: 350
            })
        );
        assert_eq!(session.amount_due, BASE_FEE - 350 + ADDON_FEE);
        assert_eq!(
            h.gateway.schedule_requests()[0].phases[0].coupon.as_deref(),
            Some("WELCOME10")
        );
    }

    #[tokio::test]
    async fn test_full_discount_returns_no_client_secret() {
        let h = harness_with(MockGateway::new().with_coupon(Coupon::percent("FREE", 100.0)));
        let order = submitted_order(&h, &SessionId::new()).await;

        let session = h
            .checkout
            .create_checkout_session(&request(&order, &[], Some("FREE")))
            .await
            .unwrap();
        assert_eq!(session.amount_due, 0);
        assert!(session.client_secret.is_none());
    }

    #[tokio::test]
    async fn test_invalid_language_codes_are_reported() {
        let h = harness();
        let order = submitted_order(&h, &SessionId::new()).await;

        let err = h
            .checkout
            .create_checkout_session(&request(&order, &["fr", "xx", ""], None))
            .await
            .unwrap_err();
        match err {
            PaymentError::InvalidLanguageCodes(codes) => assert_eq!(codes, vec!["xx", ""]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sixth_attempt_in_an_hour_is_rejected() {
        let h = harness();
        let session = SessionId::new();

        for _ in 0..5 {
            let order = submitted_order(&h, &session).await;
            h.checkout.create_checkout_session(&request(&order, &[], None)).await.unwrap();
        }
        let order = submitted_order(&h, &session).await;
        let err = h.checkout.create_checkout_session(&request(&order, &[], None)).await.unwrap_err();

        assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(h.analytics.count_of(AnalyticsEventType::PaymentAttempt).await, 5);
        assert_eq!(h.gateway.count("create_subscription_schedule"), 5);

        let other = submitted_order(&h, &SessionId::new()).await;
        assert!(h.checkout.create_checkout_session(&request(&other, &[], None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_order_is_invalid_submission() {
        let h = harness();
        let err = h.checkout.validate_submission(&OrderId::new()).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_SUBMISSION_ID");
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_existing_customer_is_reused() {
        let gateway = MockGateway::new().with_customer(Customer {
            id: "cus_known".into(),
            email: Some("owner@example.com".into()),
            name: None,
        });
        let h = harness_with(gateway);
        let order = submitted_order(&h, &SessionId::new()).await;

        let session = h.checkout.create_checkout_session(&request(&order, &[], None)).await.unwrap();
        assert_eq!(session.customer_ref, "cus_known");
        assert_eq!(h.gateway.count("create_customer"), 0);
    }

    #[tokio::test]
    async fn test_transient_gateway_failure_is_retried_with_same_idempotency_key() {
        let h = harness();
        let checkout = CheckoutOrchestrator::new(h.orders.clone(), h.analytics.clone(), h.gateway.clone())
            .with_resilience({
                let mut kit = ResilienceKit::for_tests();
                kit.gateway = kit.gateway.with_policy(
                    checkout_core::RetryPolicy::fast().with_delays(
                        std::time::Duration::from_millis(1),
                        std::time::Duration::from_millis(1),
                    ),
                );
                kit
            });
        let order = submitted_order(&h, &SessionId::new()).await;
        h.gateway.fail_next("create_subscription_schedule", 503);

        checkout.create_checkout_session(&request(&order, &[], None)).await.unwrap();

        let schedules = h.gateway.schedule_requests();
        assert_eq!(schedules.len(), 2);
        assert_eq!(schedules[0].idempotency_key, schedules[1].idempotency_key);
    }

    #[tokio::test]
    async fn test_gateway_client_error_surfaces_without_claiming_order() {
        let h = harness();
        let order = submitted_order(&h, &SessionId::new()).await;
        h.gateway.fail_next("finalize_invoice", 400);

        let err = h.checkout.create_checkout_session(&request(&order, &[], None)).await.unwrap_err();
        assert_eq!(err.code(), "STRIPE_API_ERROR");
        assert!(!err.user_message().contains("mock"));
        let stored = h.orders.get(&order.id).await.unwrap().unwrap();
        assert!(stored.subscription_ref.is_none());
        assert_eq!(stored.status, OrderStatus::Submitted);
    }

    #[test]
    fn test_customer_info_fallbacks() {
        let h = harness();
        let session = SessionId::new();

        let nested = Order::new(session.clone(), json!({"step3": {"businessEmail": "n@x.io", "businessName": "Nested"}}));
        let info = h.checkout.extract_customer_info(&nested).unwrap();
        assert_eq!(info.email, "n@x.io");
        assert_eq!(info.business_name, "Nested");

        let top = Order::new(session.clone(), json!({"email": "  "})).with_email("top@x.io");
        let info = h.checkout.extract_customer_info(&top).unwrap();
        assert_eq!(info.email, "top@x.io");
        assert_eq!(info.business_name, UNKNOWN_BUSINESS);

        let preferred = Order::new(session.clone(), json!({"email": "a@x.io", "businessEmail": "b@x.io"}));
        assert_eq!(h.checkout.extract_customer_info(&preferred).unwrap().email, "a@x.io");

        let missing = Order::new(session, json!({"businessName": "No Mail"}));
        assert!(matches!(
            h.checkout.extract_customer_info(&missing),
            Err(PaymentError::MissingCustomerEmail)
        ));
    }

    struct DownAnalytics;

    #[async_trait]
    impl AnalyticsLog for DownAnalytics {
        async fn record(&self, _event: AnalyticsEvent) -> checkout_core::Result<()> {
            Err(StoreError::Unavailable("analytics down".into()))
        }

        async fn count_since(
            &self,
            _session_id: &SessionId,
            _event_type: AnalyticsEventType,
            _since: DateTime<Utc>,
        ) -> checkout_core::Result<u64> {
            Err(StoreError::Unavailable("analytics down".into()))
        }
    }

    #[tokio::test]
    async fn test_attempt_counter_outage_fails_open_by_default() {
        let orders = Arc::new(MemoryOrderStore::new());
        let gateway = Arc::new(MockGateway::new());
        let checkout = CheckoutOrchestrator::new(orders.clone(), Arc::new(DownAnalytics), gateway)
            .with_resilience(ResilienceKit::for_tests());
        let order = Order::new(SessionId::new(), json!({"email": "a@x.io"}));
        orders.insert(&order).await.unwrap();

        let allowance = checkout.check_rate_limit(&order.session_id).await;
        assert!(allowance.allowed);
        assert_eq!(allowance.attempts_remaining, DEFAULT_ATTEMPT_LIMIT);
        assert!(checkout.create_checkout_session(&request(&order, &[], None)).await.is_ok());

        let strict = CheckoutOrchestrator::new(orders, Arc::new(DownAnalytics), Arc::new(MockGateway::new()))
            .with_resilience(ResilienceKit::for_tests())
            .with_count_failure_policy(LimiterFailurePolicy::FailClosed);
        let allowance = strict.check_rate_limit(&order.session_id).await;
        assert!(!allowance.allowed);
        assert_eq!(allowance.attempts_remaining, 0);
    }

    #[tokio::test]
    async fn test_validate_discount_previews_against_base_fee() {
        let h = harness_with(
            MockGateway::new()
                .with_coupon(Coupon::percent("P15", 15.0))
                .with_coupon(Coupon::amount("A10", 1000, "eur")),
        );
        let pct = h.checkout.validate_discount("P15").await.unwrap();
        assert_eq!(pct.amount, 525);
        assert_eq!(pct.kind, DiscountKind::Percent(15.0));
        let fixed = h.checkout.validate_discount("A10").await.unwrap();
        assert_eq!(fixed.amount, 1000);
        assert!(h.checkout.validate_discount("MISSING").await.is_err());
    }
}
