//! Stripe Gateway
//!
//! Built on `async-stripe`. Typed resources cover customers, coupons,
//! subscriptions and invoice items; subscription schedules and invoice
//! finalization go through the client's form endpoints with our own bodies.
//! Every failure keeps Stripe's HTTP status so the retry layer can tell a
//! declined request (4xx, final) from an outage (5xx / network, retried).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use stripe::{
    Client, Coupon as StripeCoupon, CouponId, CreateCustomer, CreateInvoiceItem, Currency,
    Customer as StripeCustomer, CustomerId, Expandable, InvoiceId, InvoiceItem, ListCustomers,
    RequestStrategy, StripeError, Subscription as StripeSubscription, SubscriptionId,
};

use super::{
    Coupon, Customer, EndBehavior, Invoice, InvoiceItemRequest, NewCustomer, PaymentGateway,
    SchedulePhase, ScheduleRequest, Subscription, SubscriptionSchedule,
};
use crate::error::{PaymentError, Result};

/// Stripe credentials and endpoint
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Recurring price of the base subscription
    pub base_price_id: String,
    /// Alternate API host, e.g. a local stripe-mock
    pub api_base: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("base_price_id", &self.base_price_id)
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StripeConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| PaymentError::Config(format!("{key} not set")))
        };

        Ok(Self {
            secret_key: require("STRIPE_SECRET_KEY")?,
            webhook_secret: require("STRIPE_WEBHOOK_SECRET")?,
            base_price_id: require("STRIPE_BASE_PRICE_ID")?,
            api_base: lookup("STRIPE_API_BASE").filter(|v| !v.trim().is_empty()),
            timeout: lookup("STRIPE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map_or(Duration::from_secs(20), Duration::from_secs),
        })
    }
}

/// Stripe client
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = match &config.api_base {
            Some(base) => Client::from_url(base.as_str(), config.secret_key.clone()),
            None => Client::new(config.secret_key.clone()),
        };
        Self { client, config }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// Get the webhook secret
    pub fn webhook_secret(&self) -> &str {
        &self.config.webhook_secret
    }

    /// Client that sends `Idempotency-Key` on every request
    fn idempotent(&self, key: &str) -> Client {
        self.client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key.to_string()))
    }

    async fn send<T>(
        &self,
        operation: &str,
        request: impl Future<Output = std::result::Result<T, StripeError>>,
    ) -> Result<T> {
        let result = tokio::time::timeout(self.config.timeout, request)
            .await
            .map_err(|_| PaymentError::Timeout(operation.to_string()))?;
        result.map_err(|e| {
            let err = map_stripe_error(e, operation);
            tracing::warn!(operation, error = %err, "Stripe request failed");
            err
        })
    }
}

/// Map Stripe SDK errors onto payment errors
fn map_stripe_error(error: StripeError, operation: &str) -> PaymentError {
    match error {
        StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            PaymentError::Gateway {
                operation: operation.to_string(),
                status: Some(status),
                code: request_error.code.as_ref().map(|c| format!("{c:?}")),
                message: request_error
                    .message
                    .unwrap_or_else(|| format!("HTTP {status}")),
            }
        }
        StripeError::Timeout => PaymentError::Timeout(operation.to_string()),
        StripeError::ClientError(message) => PaymentError::Network {
            operation: operation.to_string(),
            message,
        },
        StripeError::QueryStringSerialize(e) => {
            PaymentError::Config(format!("{operation}: request encoding: {e}"))
        }
        StripeError::JSONSerialize(e) => {
            PaymentError::Config(format!("{operation}: undecodable response: {e}"))
        }
        StripeError::UnsupportedVersion => {
            PaymentError::Config(format!("{operation}: unsupported Stripe API version"))
        }
    }
}

fn customer_id(raw: &str) -> Result<CustomerId> {
    raw.parse()
        .map_err(|e| PaymentError::Config(format!("invalid customer id {raw}: {e}")))
}

fn currency(raw: &str) -> Result<Currency> {
    serde_json::from_value(Value::String(raw.to_lowercase()))
        .map_err(|_| PaymentError::Config(format!("unsupported currency {raw}")))
}

fn metadata(source: &BTreeMap<String, String>) -> HashMap<String, String> {
    source.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(1);
        let list = self
            .send("list_customers", StripeCustomer::list(&self.client, &params))
            .await?;
        Ok(list.data.into_iter().next().map(into_customer))
    }

    async fn create_customer(&self, customer: &NewCustomer) -> Result<Customer> {
        let client = self.idempotent(&customer.idempotency_key);
        let mut params = CreateCustomer::new();
        params.email = Some(&customer.email);
        params.name = Some(&customer.name);
        params.metadata = Some(metadata(&customer.metadata));
        let created = self
            .send("create_customer", StripeCustomer::create(&client, params))
            .await?;
        Ok(into_customer(created))
    }

    async fn retrieve_coupon(&self, code: &str) -> Result<Option<Coupon>> {
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Ok(None);
        }
        let Ok(id) = code.parse::<CouponId>() else {
            return Ok(None);
        };
        match self
            .send("retrieve_coupon", StripeCoupon::retrieve(&self.client, &id, &[]))
            .await
        {
            Ok(coupon) => Ok(Some(into_coupon(coupon))),
            Err(PaymentError::Gateway { status: Some(404), .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_subscription_schedule(&self, request: &ScheduleRequest) -> Result<SubscriptionSchedule> {
        let client = self.idempotent(&request.idempotency_key);
        let form = ScheduleForm::from_request(request);
        let wire: WireSchedule = self
            .send(
                "create_subscription_schedule",
                client.post_form("/subscription_schedules", &form),
            )
            .await?;
        Ok(wire.into_schedule())
    }

    async fn retrieve_subscription(&self, subscription_ref: &str) -> Result<Subscription> {
        let id = subscription_ref.parse::<SubscriptionId>().map_err(|e| {
            PaymentError::Config(format!("invalid subscription id {subscription_ref}: {e}"))
        })?;
        let sub = self
            .send(
                "retrieve_subscription",
                StripeSubscription::retrieve(&self.client, &id, &[]),
            )
            .await?;
        Ok(into_subscription(sub))
    }

    async fn add_invoice_item(&self, item: &InvoiceItemRequest) -> Result<()> {
        let client = self.idempotent(&item.idempotency_key);
        let invoice = item.invoice_ref.parse::<InvoiceId>().map_err(|e| {
            PaymentError::Config(format!("invalid invoice id {}: {e}", item.invoice_ref))
        })?;

        let mut params = CreateInvoiceItem::new(customer_id(&item.customer_ref)?);
        params.invoice = Some(invoice);
        params.amount = Some(item.amount);
        params.currency = Some(currency(&item.currency)?);
        params.description = Some(&item.description);
        params.metadata = Some(metadata(&item.metadata));
        self.send("add_invoice_item", InvoiceItem::create(&client, params))
            .await?;
        Ok(())
    }

    async fn finalize_invoice(&self, invoice_ref: &str) -> Result<Invoice> {
        let form = FinalizeForm {
            expand: &["payment_intent"],
        };
        let path = format!("/invoices/{invoice_ref}/finalize");
        let wire: WireInvoice = self
            .send("finalize_invoice", self.client.post_form(&path, &form))
            .await?;
        Ok(wire.into_invoice())
    }

    fn base_price_ref(&self) -> &str {
        &self.config.base_price_id
    }
}

fn into_customer(customer: StripeCustomer) -> Customer {
    Customer {
        id: customer.id.to_string(),
        email: customer.email,
        name: customer.name,
    }
}

fn into_coupon(coupon: StripeCoupon) -> Coupon {
    Coupon {
        id: coupon.id.to_string(),
        valid: coupon.valid.unwrap_or(false),
        percent_off: coupon.percent_off,
        amount_off: coupon.amount_off,
        currency: coupon.currency.map(|c| c.to_string().to_uppercase()),
    }
}

fn into_subscription(sub: StripeSubscription) -> Subscription {
    let customer_ref = match &sub.customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(c) => c.id.to_string(),
    };
    let schedule_ref = sub.schedule.as_ref().map(|s| match s {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(s) => s.id.to_string(),
    });
    let latest_invoice = sub.latest_invoice.as_ref().map(|i| match i {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(i) => i.id.to_string(),
    });
    Subscription {
        id: sub.id.to_string(),
        status: sub.status.as_str().to_string(),
        customer_ref: Some(customer_ref),
        schedule_ref,
        latest_invoice,
        metadata: sub.metadata.into_iter().collect(),
    }
}

/// Body of `POST /v1/subscription_schedules`
#[derive(Debug, Serialize)]
struct ScheduleForm<'a> {
    customer: &'a str,
    start_date: i64,
    end_behavior: EndBehavior,
    phases: Vec<PhaseForm<'a>>,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct PhaseForm<'a> {
    items: Vec<PhaseItemForm<'a>>,
    end_date: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    coupon: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct PhaseItemForm<'a> {
    price: &'a str,
    quantity: u32,
}

impl<'a> ScheduleForm<'a> {
    fn from_request(request: &'a ScheduleRequest) -> Self {
        Self {
            customer: &request.customer_ref,
            start_date: request.start_date.timestamp(),
            end_behavior: request.end_behavior,
            phases: request
                .phases
                .iter()
                .map(|phase| PhaseForm {
                    items: vec![PhaseItemForm {
                        price: &phase.price_ref,
                        quantity: phase.quantity,
                    }],
                    end_date: phase.end_date.timestamp(),
                    coupon: phase.coupon.as_deref(),
                })
                .collect(),
            metadata: &request.metadata,
        }
    }
}

/// Body of `POST /v1/invoices/{id}/finalize`
#[derive(Debug, Serialize)]
struct FinalizeForm {
    expand: &'static [&'static str],
}

/// Id of a field that is either an id string or an expanded object
fn expandable_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) => Some(id.clone()),
        Value::Object(obj) => obj.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn from_timestamp(secs: Option<i64>) -> DateTime<Utc> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct WireSchedule {
    id: String,
    subscription: Option<Value>,
    #[serde(default)]
    end_behavior: EndBehavior,
    #[serde(default)]
    phases: Vec<WirePhase>,
}

#[derive(Debug, Deserialize)]
struct WirePhase {
    end_date: Option<i64>,
    #[serde(default)]
    items: Vec<WirePhaseItem>,
    coupon: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WirePhaseItem {
    price: Option<Value>,
    quantity: Option<u32>,
}

impl WireSchedule {
    fn into_schedule(self) -> SubscriptionSchedule {
        SubscriptionSchedule {
            subscription_ref: expandable_id(self.subscription.as_ref()),
            end_behavior: self.end_behavior,
            phases: self
                .phases
                .into_iter()
                .map(|phase| {
                    let item = phase.items.first();
                    SchedulePhase {
                        price_ref: expandable_id(item.and_then(|i| i.price.as_ref())).unwrap_or_default(),
                        quantity: item.and_then(|i| i.quantity).unwrap_or(1),
                        end_date: from_timestamp(phase.end_date),
                        coupon: expandable_id(phase.coupon.as_ref()),
                    }
                })
                .collect(),
            id: self.id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireInvoice {
    id: String,
    amount_due: i64,
    currency: String,
    status: Option<String>,
    payment_intent: Option<Value>,
}

impl WireInvoice {
    fn into_invoice(self) -> Invoice {
        let client_secret = self
            .payment_intent
            .as_ref()
            .and_then(|pi| pi.get("client_secret"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Invoice {
            payment_intent: expandable_id(self.payment_intent.as_ref()),
            client_secret,
            id: self.id,
            amount_due: self.amount_due,
            currency: self.currency.to_uppercase(),
            status: self.status.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkout_core::Classify;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn request_error(status: u16, message: &str) -> StripeError {
        let mut err: stripe::RequestError = serde_json::from_value(json!({
            "type": "invalid_request_error",
            "message": message,
        }))
        .unwrap();
        err.http_status = status;
        StripeError::Stripe(err)
    }

    fn schedule_request(coupon: Option<&str>) -> ScheduleRequest {
        let start = Utc::now();
        ScheduleRequest {
            customer_ref: "cus_1".into(),
            start_date: start,
            end_behavior: EndBehavior::Release,
            phases: vec![SchedulePhase {
                price_ref: "price_base".into(),
                quantity: 1,
                end_date: start + ChronoDuration::days(365),
                coupon: coupon.map(str::to_string),
            }],
            metadata: BTreeMap::from([("submission_id".to_string(), "ord_1".to_string())]),
            idempotency_key: "k".into(),
        }
    }

    #[test]
    fn test_config_requires_all_credentials() {
        let vars = |key: &str| match key {
            "STRIPE_SECRET_KEY" => Some("sk_test_1".to_string()),
            "STRIPE_WEBHOOK_SECRET" => Some("whsec_1".to_string()),
            _ => None,
        };
        let err = StripeConfig::from_lookup(vars).unwrap_err();
        assert!(err.to_string().contains("STRIPE_BASE_PRICE_ID"));

        let config = StripeConfig::from_lookup(|key| match key {
            "STRIPE_SECRET_KEY" => Some("sk_test_1".into()),
            "STRIPE_WEBHOOK_SECRET" => Some("whsec_1".into()),
            "STRIPE_BASE_PRICE_ID" => Some("price_base".into()),
            _ => None,
        })
        .unwrap();
        assert!(config.api_base.is_none());
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert!(!format!("{config:?}").contains("sk_test_1"));
    }

    #[test]
    fn test_stripe_errors_keep_retry_classification() {
        let not_found = map_stripe_error(request_error(404, "No such coupon: 'X'"), "retrieve_coupon");
        assert!(matches!(not_found, PaymentError::Gateway { status: Some(404), .. }));
        assert!(!not_found.is_retryable());
        assert!(not_found.to_string().contains("No such coupon"));

        assert!(map_stripe_error(request_error(503, "down"), "create_customer").is_retryable());

        let timeout = map_stripe_error(StripeError::Timeout, "finalize_invoice");
        assert!(matches!(timeout, PaymentError::Timeout(_)));
        assert!(timeout.is_retryable());

        let network = map_stripe_error(StripeError::ClientError("connection reset".into()), "list_customers");
        assert!(network.failure_kind().is_transient());

        assert!(!map_stripe_error(StripeError::UnsupportedVersion, "x").is_retryable());
    }

    #[test]
    fn test_schedule_form_encodes_single_release_phase() {
        let request = schedule_request(Some("WELCOME10"));
        let form = serde_json::to_value(ScheduleForm::from_request(&request)).unwrap();
        assert_eq!(form["customer"], "cus_1");
        assert_eq!(form["end_behavior"], "release");
        assert_eq!(form["start_date"], request.start_date.timestamp());
        assert_eq!(form["phases"].as_array().map(Vec::len), Some(1));
        assert_eq!(form["phases"][0]["items"][0]["price"], "price_base");
        assert_eq!(form["phases"][0]["items"][0]["quantity"], 1);
        assert_eq!(form["phases"][0]["coupon"], "WELCOME10");
        assert_eq!(form["metadata"]["submission_id"], "ord_1");
    }

    #[test]
    fn test_schedule_form_omits_missing_coupon() {
        let request = schedule_request(None);
        let form = serde_json::to_value(ScheduleForm::from_request(&request)).unwrap();
        assert!(form["phases"][0].get("coupon").is_none());
    }

    #[test]
    fn test_currency_codes_are_case_insensitive() {
        assert_eq!(currency("EUR").unwrap(), Currency::EUR);
        assert_eq!(currency("usd").unwrap(), Currency::USD);
    }

    #[test]
    fn test_expandable_fields() {
        assert_eq!(expandable_id(Some(&json!("in_1"))), Some("in_1".into()));
        assert_eq!(expandable_id(Some(&json!({"id": "pi_1"}))), Some("pi_1".into()));
        assert_eq!(expandable_id(Some(&Value::Null)), None);
        assert_eq!(expandable_id(None), None);
    }

    #[test]
    fn test_wire_invoice_reads_expanded_payment_intent() {
        let wire: WireInvoice = serde_json::from_value(json!({
            "id": "in_1",
            "amount_due": 26000,
            "currency": "eur",
            "status": "open",
            "payment_intent": {"id": "pi_1", "client_secret": "pi_1_secret_x"}
        }))
        .unwrap();
        let invoice = wire.into_invoice();
        assert_eq!(invoice.currency, "EUR");
        assert_eq!(invoice.payment_intent.as_deref(), Some("pi_1"));
        assert_eq!(invoice.client_secret.as_deref(), Some("pi_1_secret_x"));
    }

    #[test]
    fn test_wire_schedule_reads_started_subscription() {
        let wire: WireSchedule = serde_json::from_value(json!({
            "id": "sub_sched_1",
            "subscription": "sub_1",
            "end_behavior": "release",
            "phases": [{
                "end_date": 1_800_000_000,
                "items": [{"price": {"id": "price_base"}, "quantity": 1}],
                "coupon": null
            }]
        }))
        .unwrap();
        let schedule = wire.into_schedule();
        assert_eq!(schedule.subscription_ref.as_deref(), Some("sub_1"));
        assert_eq!(schedule.phases[0].price_ref, "price_base");
        assert!(schedule.phases[0].coupon.is_none());
    }
}
