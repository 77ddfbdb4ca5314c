//! In-memory gateway (for development/testing)
//!
//! Behaves like the provider for the calls the checkout makes: customers and
//! schedules honour idempotency keys, a schedule starts a subscription with an
//! open first invoice, and finalizing applies the phase coupon to the base
//! price. Failures can be queued per operation.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    Coupon, Customer, Invoice, InvoiceItemRequest, NewCustomer, PaymentGateway, ScheduleRequest,
    Subscription, SubscriptionSchedule,
};
use crate::catalog::BASE_FEE;
use crate::error::{PaymentError, Result};

/// A recorded gateway call
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayCall {
    FindCustomer(String),
    CreateCustomer(NewCustomer),
    RetrieveCoupon(String),
    CreateSchedule(ScheduleRequest),
    RetrieveSubscription(String),
    AddInvoiceItem(InvoiceItemRequest),
    FinalizeInvoice(String),
}

impl GatewayCall {
    pub const fn operation(&self) -> &'static str {
        match self {
            Self::FindCustomer(_) => "find_customer_by_email",
            Self::CreateCustomer(_) => "create_customer",
            Self::RetrieveCoupon(_) => "retrieve_coupon",
            Self::CreateSchedule(_) => "create_subscription_schedule",
            Self::RetrieveSubscription(_) => "retrieve_subscription",
            Self::AddInvoiceItem(_) => "add_invoice_item",
            Self::FinalizeInvoice(_) => "finalize_invoice",
        }
    }
}

#[derive(Debug)]
struct MockInvoice {
    customer_ref: String,
    base_amount: i64,
    items: i64,
    currency: String,
    coupon: Option<Coupon>,
}

#[derive(Debug, Default)]
struct MockState {
    seq: u32,
    calls: Vec<GatewayCall>,
    customers: Vec<Customer>,
    coupons: HashMap<String, Coupon>,
    subscriptions: HashMap<String, Subscription>,
    schedules: HashMap<String, SubscriptionSchedule>,
    invoices: HashMap<String, MockInvoice>,
    idempotent: HashMap<String, String>,
    failures: HashMap<&'static str, VecDeque<u16>>,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}_mock{}", self.seq)
    }
}

/// Recording in-memory gateway
#[derive(Debug)]
pub struct MockGateway {
    base_price_ref: String,
    base_amount: i64,
    currency: String,
    state: Mutex<MockState>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            base_price_ref: "price_base_mock".into(),
            base_amount: BASE_FEE,
            currency: "EUR".into(),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_coupon(self, coupon: Coupon) -> Self {
        self.state().coupons.insert(coupon.id.clone(), coupon);
        self
    }

    pub fn with_customer(self, customer: Customer) -> Self {
        self.state().customers.push(customer);
        self
    }

    pub fn with_subscription(self, subscription: Subscription) -> Self {
        self.state()
            .subscriptions
            .insert(subscription.id.clone(), subscription);
        self
    }

    /// Fail the next call to `operation` with this HTTP status; `0` is a
    /// connection failure. Queued failures are consumed in order.
    pub fn fail_next(&self, operation: &'static str, status: u16) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(status);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    /// Number of calls made to `operation`
    pub fn count(&self, operation: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    /// Schedule requests received, in order
    pub fn schedule_requests(&self) -> Vec<ScheduleRequest> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                GatewayCall::CreateSchedule(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call, then fail it if a failure is queued
    fn enter(&self, call: GatewayCall) -> Result<MutexGuard<'_, MockState>> {
        let operation = call.operation();
        let mut state = self.state();
        state.calls.push(call);
        match state.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(0) => Err(PaymentError::Network {
                operation: operation.to_string(),
                message: "connection reset".into(),
            }),
            Some(status) => Err(PaymentError::Gateway {
                operation: operation.to_string(),
                status: Some(status),
                code: None,
                message: format!("mock failure {status}"),
            }),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>> {
        let state = self.enter(GatewayCall::FindCustomer(email.to_string()))?;
        Ok(state
            .customers
            .iter()
            .find(|c| c.email.as_deref() == Some(email))
            .cloned())
    }

    async fn create_customer(&self, customer: &NewCustomer) -> Result<Customer> {
        let mut state = self.enter(GatewayCall::CreateCustomer(customer.clone()))?;
        if let Some(id) = state.idempotent.get(&customer.idempotency_key).cloned() {
            if let Some(existing) = state.customers.iter().find(|c| c.id == id) {
                return Ok(existing.clone());
            }
        }
        let created = Customer {
            id: state.next_id("cus"),
            email: Some(customer.email.clone()),
            name: Some(customer.name.clone()),
        };
        state
            .idempotent
            .insert(customer.idempotency_key.clone(), created.id.clone());
        state.customers.push(created.clone());
        Ok(created)
    }

    async fn retrieve_coupon(&self, code: &str) -> Result<Option<Coupon>> {
        let state = self.enter(GatewayCall::RetrieveCoupon(code.to_string()))?;
        Ok(state.coupons.get(code).cloned())
    }

    async fn create_subscription_schedule(&self, request: &ScheduleRequest) -> Result<SubscriptionSchedule> {
        let mut state = self.enter(GatewayCall::CreateSchedule(request.clone()))?;
        if let Some(id) = state.idempotent.get(&request.idempotency_key).cloned() {
            if let Some(existing) = state.schedules.get(&id) {
                return Ok(existing.clone());
            }
        }

        let schedule_id = state.next_id("sub_sched");
        let subscription_id = state.next_id("sub");
        let invoice_id = state.next_id("in");
        let phase = request.phases.first();
        let quantity = i64::from(phase.map_or(1, |p| p.quantity));
        let coupon = phase
            .and_then(|p| p.coupon.as_ref())
            .and_then(|code| state.coupons.get(code).cloned());

        state.invoices.insert(
            invoice_id.clone(),
            MockInvoice {
                customer_ref: request.customer_ref.clone(),
                base_amount: self.base_amount * quantity,
                items: 0,
                currency: self.currency.clone(),
                coupon,
            },
        );
        state.subscriptions.insert(
            subscription_id.clone(),
            Subscription {
                id: subscription_id.clone(),
                status: "incomplete".into(),
                customer_ref: Some(request.customer_ref.clone()),
                schedule_ref: Some(schedule_id.clone()),
                latest_invoice: Some(invoice_id),
                metadata: request.metadata.clone(),
            },
        );
        let schedule = SubscriptionSchedule {
            id: schedule_id.clone(),
            subscription_ref: Some(subscription_id),
            end_behavior: request.end_behavior,
            phases: request.phases.clone(),
        };
        state.schedules.insert(schedule_id.clone(), schedule.clone());
        state
            .idempotent
            .insert(request.idempotency_key.clone(), schedule_id);
        Ok(schedule)
    }

    async fn retrieve_subscription(&self, subscription_ref: &str) -> Result<Subscription> {
        let state = self.enter(GatewayCall::RetrieveSubscription(subscription_ref.to_string()))?;
        state
            .subscriptions
            .get(subscription_ref)
            .cloned()
            .ok_or_else(|| PaymentError::Gateway {
                operation: "retrieve_subscription".into(),
                status: Some(404),
                code: Some("resource_missing".into()),
                message: format!("No such subscription: {subscription_ref}"),
            })
    }

    async fn add_invoice_item(&self, item: &InvoiceItemRequest) -> Result<()> {
        let mut state = self.enter(GatewayCall::AddInvoiceItem(item.clone()))?;
        let invoice = state
            .invoices
            .get_mut(&item.invoice_ref)
            .filter(|inv| inv.customer_ref == item.customer_ref)
            .ok_or_else(|| PaymentError::Gateway {
                operation: "add_invoice_item".into(),
                status: Some(400),
                code: Some("invoice_not_editable".into()),
                message: format!("No open invoice {} for customer", item.invoice_ref),
            })?;
        invoice.items += item.amount;
        Ok(())
    }

    async fn finalize_invoice(&self, invoice_ref: &str) -> Result<Invoice> {
        let mut state = self.enter(GatewayCall::FinalizeInvoice(invoice_ref.to_string()))?;
        let seq = state.seq;
        let invoice = state.invoices.get(invoice_ref).ok_or_else(|| PaymentError::Gateway {
            operation: "finalize_invoice".into(),
            status: Some(404),
            code: Some("resource_missing".into()),
            message: format!("No such invoice: {invoice_ref}"),
        })?;

        let discount = invoice
            .coupon
            .as_ref()
            .and_then(Coupon::kind)
            .map_or(0, |kind| kind.amount_off(invoice.base_amount));
        let amount_due = (invoice.base_amount - discount).max(0) + invoice.items;
        let (payment_intent, client_secret, status) = if amount_due > 0 {
            let pi = format!("pi_mock{seq}");
            let secret = format!("{pi}_secret_mock");
            (Some(pi), Some(secret), "open")
        } else {
            (None, None, "paid")
        };
        let finalized = Invoice {
            id: invoice_ref.to_string(),
            amount_due,
            currency: invoice.currency.clone(),
            status: status.into(),
            payment_intent,
            client_secret,
        };
        state.seq += 1;
        Ok(finalized)
    }

    fn base_price_ref(&self) -> &str {
        &self.base_price_ref
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{EndBehavior, SchedulePhase};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn schedule_request(key: &str, coupon: Option<&str>) -> ScheduleRequest {
        let now = Utc::now();
        ScheduleRequest {
            customer_ref: "cus_1".into(),
            start_date: now,
            end_behavior: EndBehavior::Release,
            phases: vec![SchedulePhase {
                price_ref: "price_base_mock".into(),
                quantity: 1,
                end_date: now + Duration::days(365),
                coupon: coupon.map(str::to_string),
            }],
            metadata: BTreeMap::new(),
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn test_schedule_creation_is_idempotent_per_key() {
        let gateway = MockGateway::new();
        let first = gateway
            .create_subscription_schedule(&schedule_request("k1", None))
            .await
            .unwrap();
        let again = gateway
            .create_subscription_schedule(&schedule_request("k1", None))
            .await
            .unwrap();
        let other = gateway
            .create_subscription_schedule(&schedule_request("k2", None))
            .await
            .unwrap();

        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(gateway.count("create_subscription_schedule"), 3);
    }

    #[tokio::test]
    async fn test_finalize_applies_coupon_to_base_only() {
        let gateway = MockGateway::new().with_coupon(Coupon::percent("HALF", 50.0));
        let schedule = gateway
            .create_subscription_schedule(&schedule_request("k", Some("HALF")))
            .await
            .unwrap();
        let sub = gateway
            .retrieve_subscription(schedule.subscription_ref.as_deref().unwrap())
            .await
            .unwrap();
        let invoice_ref = sub.latest_invoice.unwrap();

        gateway
            .add_invoice_item(&InvoiceItemRequest {
                customer_ref: "cus_1".into(),
                invoice_ref: invoice_ref.clone(),
                amount: 7500,
                currency: "EUR".into(),
                description: "French translation".into(),
                metadata: BTreeMap::new(),
                idempotency_key: "i1".into(),
            })
            .await
            .unwrap();

        let invoice = gateway.finalize_invoice(&invoice_ref).await.unwrap();
        assert_eq!(invoice.amount_due, 1750 + 7500);
        assert!(invoice.client_secret.is_some());
    }

    #[tokio::test]
    async fn test_queued_failures_are_consumed_in_order() {
        let gateway = MockGateway::new();
        gateway.fail_next("find_customer_by_email", 503);
        gateway.fail_next("find_customer_by_email", 0);

        let first = gateway.find_customer_by_email("a@b.c").await.unwrap_err();
        assert!(matches!(first, PaymentError::Gateway { status: Some(503), .. }));
        let second = gateway.find_customer_by_email("a@b.c").await.unwrap_err();
        assert!(matches!(second, PaymentError::Network { .. }));
        assert!(gateway.find_customer_by_email("a@b.c").await.unwrap().is_none());
        assert_eq!(gateway.count("find_customer_by_email"), 3);
    }
}
