//! Webhook Ingestor
//!
//! ```text
//! raw body ─▶ verify signature ─▶ parse ─▶ ledger insert ─┬─▶ dispatch ─▶ ledger completed
//!                 │                  │                    │       │
//!               400                 400         duplicate id      └─▶ ledger failed ─▶ 500
//!                                                         │
//!                               failed, or processing past its lease?
//!                                          reclaim and reprocess
//!                                          otherwise reply duplicate
//! ```
//!
//! The ledger's unique insert is the only gate between concurrent deliveries
//! of one event. It runs through the datastore breaker exactly once. The
//! terminal ledger write bypasses the breaker: it must land even when the
//! handler failed because the datastore was struggling.

mod event;
mod signature;

pub use event::{EventData, GatewayEvent, OrderHints, WebhookEvent};
pub use signature::{DEFAULT_TOLERANCE_SECS, SIGNATURE_HEADER, SignatureVerifier};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use checkout_core::{
    AnalyticsEvent, AnalyticsEventType, AnalyticsLog, LedgerStatus, Order, OrderId, OrderLookup,
    OrderStatus, OrderStore, PaymentReceipt, ResilienceKit, StoreError, WebhookEventRecord,
    WebhookLedger,
};

use crate::error::{PaymentError, Result};
use crate::gateway::PaymentGateway;

/// What happened to a delivery
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Handler ran to completion
    Processed { event_id: String, event_type: String },
    /// Event id already seen; nothing was done
    Duplicate { event_id: String },
}

impl WebhookOutcome {
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// How long a `processing` row belongs to the delivery that created it.
/// Must outlast the longest a handler can run.
pub const DEFAULT_PROCESSING_LEASE_SECS: i64 = 300;

/// Webhook ingestor
pub struct WebhookIngestor {
    ledger: Arc<dyn WebhookLedger>,
    orders: Arc<dyn OrderStore>,
    analytics: Arc<dyn AnalyticsLog>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: SignatureVerifier,
    resilience: ResilienceKit,
    processing_lease: Duration,
}

impl WebhookIngestor {
    pub fn new(
        ledger: Arc<dyn WebhookLedger>,
        orders: Arc<dyn OrderStore>,
        analytics: Arc<dyn AnalyticsLog>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: SignatureVerifier,
    ) -> Self {
        Self {
            ledger,
            orders,
            analytics,
            gateway,
            verifier,
            resilience: ResilienceKit::default(),
            processing_lease: Duration::seconds(DEFAULT_PROCESSING_LEASE_SECS),
        }
    }

    pub fn with_resilience(mut self, resilience: ResilienceKit) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_processing_lease(mut self, lease: Duration) -> Self {
        self.processing_lease = lease;
        self
    }

    /// Verify, deduplicate and handle one delivery
    pub async fn receive(&self, payload: &[u8], signature: Option<&str>) -> Result<WebhookOutcome> {
        if let Err(e) = self.verifier.verify(payload, signature) {
            tracing::warn!(error = %e, "Rejected webhook delivery");
            return Err(e);
        }

        let envelope = GatewayEvent::from_slice(payload)?;
        let event = WebhookEvent::parse(&envelope)?;
        let event_id = envelope.id.clone();

        tracing::info!(event_id = %event_id, event_type = %envelope.event_type, "Processing webhook");

        if !self.admit(&envelope).await? {
            tracing::info!(event_id = %event_id, "Duplicate webhook event, skipping");
            return Ok(WebhookOutcome::Duplicate { event_id });
        }

        match self.dispatch(&envelope, event).await {
            Ok(()) => {
                self.finish(&event_id, LedgerStatus::Completed, None).await;
                Ok(WebhookOutcome::Processed {
                    event_id,
                    event_type: envelope.event_type,
                })
            }
            Err(e) => {
                let message = match e {
                    PaymentError::WebhookHandler { message, .. } => message,
                    other => other.to_string(),
                };
                tracing::error!(
                    event_id = %event_id,
                    event_type = %envelope.event_type,
                    error = %message,
                    "Webhook handler failed"
                );
                self.finish(&event_id, LedgerStatus::Failed, Some(message.clone()))
                    .await;
                Err(PaymentError::WebhookHandler { event_id, message })
            }
        }
    }

    /// Claim the event id. `false` means another delivery owns it.
    async fn admit(&self, envelope: &GatewayEvent) -> Result<bool> {
        let record = WebhookEventRecord::processing(&envelope.id, &envelope.event_type);
        let inserted = self
            .resilience
            .datastore
            .call_once(async { self.ledger.insert(&record).await.map_err(PaymentError::from) })
            .await;

        match inserted {
            Ok(()) => Ok(true),
            Err(PaymentError::Storage(StoreError::UniqueViolation(_))) => {
                let stale_before = Utc::now() - self.processing_lease;
                let reclaimed = self
                    .resilience
                    .datastore
                    .call_once(async {
                        self.ledger
                            .reclaim(&envelope.id, stale_before)
                            .await
                            .map_err(PaymentError::from)
                    })
                    .await?;
                if reclaimed {
                    tracing::info!(event_id = %envelope.id, "Reprocessing unfinished event");
                }
                Ok(reclaimed)
            }
            Err(e) => Err(e),
        }
    }

    /// Record the outcome. If this write is lost the row stays `processing`
    /// and a redelivery after the lease reclaims it.
    async fn finish(&self, event_id: &str, status: LedgerStatus, error: Option<String>) {
        let result = self
            .resilience
            .datastore
            .call_without_breaker("finish_webhook_event", || async {
                self.ledger
                    .finish(event_id, status, error.clone())
                    .await
                    .map_err(PaymentError::from)
            })
            .await;
        if let Err(e) = result {
            tracing::error!(
                event_id = %event_id,
                status = status.as_str(),
                error = %e,
                "Could not update webhook ledger"
            );
        }
    }

    async fn dispatch(&self, envelope: &GatewayEvent, event: WebhookEvent) -> Result<()> {
        let fallback_time = envelope.created_at();
        match event {
            WebhookEvent::InvoicePaid {
                invoice_ref,
                transaction_ref,
                amount_paid,
                currency,
                paid_at,
                hints,
            } => {
                let hints = self.enrich_from_subscription(hints).await;
                let mut order = self.require_order(envelope, &hints).await?;
                if let Some(incoming) = hints.subscription_ref.as_deref() {
                    if !order.accepts_subscription(incoming) {
                        // Reached through the shared customer; not this order's invoice.
                        tracing::warn!(
                            order_id = %order.id,
                            current = ?order.subscription_ref,
                            incoming = %incoming,
                            invoice_ref = %invoice_ref,
                            "Invoice belongs to another subscription, order left unchanged"
                        );
                        return Ok(());
                    }
                }
                let receipt = PaymentReceipt {
                    transaction_ref,
                    customer_ref: hints.customer_ref.clone(),
                    subscription_ref: hints.subscription_ref.clone(),
                    amount: amount_paid,
                    currency,
                    card_last4: None,
                    paid_at: paid_at.unwrap_or(fallback_time),
                };
                self.settle(&mut order, receipt).await?;
                tracing::info!(order_id = %order.id, invoice_ref = %invoice_ref, "Invoice paid");
                self.record_for(
                    &order,
                    AnalyticsEventType::PaymentSucceeded,
                    json!({"invoice_ref": invoice_ref, "amount": order.payment_amount, "currency": order.currency}),
                )
                .await;
            }

            WebhookEvent::PaymentSucceeded {
                transaction_ref,
                amount,
                currency,
                card_last4,
                hints,
            } => {
                let mut order = self.require_order(envelope, &hints).await?;
                let receipt = PaymentReceipt {
                    transaction_ref: Some(transaction_ref.clone()),
                    customer_ref: hints.customer_ref.clone(),
                    subscription_ref: None,
                    amount,
                    currency,
                    card_last4,
                    paid_at: fallback_time,
                };
                self.settle(&mut order, receipt).await?;
                tracing::info!(order_id = %order.id, transaction_ref = %transaction_ref, "Payment succeeded");
                self.record_for(
                    &order,
                    AnalyticsEventType::PaymentSucceeded,
                    json!({"transaction_ref": transaction_ref, "amount": order.payment_amount}),
                )
                .await;
            }

            WebhookEvent::SubscriptionChanged {
                subscription_ref,
                status,
                created,
                hints,
            } => {
                let analytics_type = if created {
                    AnalyticsEventType::SubscriptionCreated
                } else {
                    AnalyticsEventType::SubscriptionUpdated
                };
                let Some(mut order) = self.find_order(&hints).await? else {
                    tracing::info!(subscription_ref = %subscription_ref, "No order for subscription, ignoring");
                    self.record(AnalyticsEvent::new(
                        analytics_type,
                        json!({"subscription_ref": subscription_ref, "status": status}),
                    ))
                    .await;
                    return Ok(());
                };

                match order.subscription_ref.as_deref() {
                    Some(current) if current != subscription_ref => {
                        tracing::warn!(
                            order_id = %order.id,
                            current = %current,
                            incoming = %subscription_ref,
                            "Order already tracks another subscription, not overwriting"
                        );
                    }
                    _ => {
                        order.attach_subscription(
                            subscription_ref.clone(),
                            Some(status.clone()),
                            hints.customer_ref.clone(),
                            hints.schedule_ref.clone(),
                        );
                        self.save(&order).await?;
                        tracing::info!(
                            order_id = %order.id,
                            subscription_ref = %subscription_ref,
                            status = %status,
                            "Subscription state recorded"
                        );
                    }
                }
                self.record_for(
                    &order,
                    analytics_type,
                    json!({"subscription_ref": subscription_ref, "status": status}),
                )
                .await;
            }

            WebhookEvent::SubscriptionDeleted {
                subscription_ref,
                canceled_at,
                hints,
            } => {
                let data = json!({"subscription_ref": subscription_ref});
                self.cancel(&hints, canceled_at.unwrap_or(fallback_time), AnalyticsEventType::SubscriptionDeleted, data)
                    .await?;
            }

            WebhookEvent::ScheduleCanceled {
                schedule_ref,
                canceled_at,
                hints,
            } => {
                let data = json!({"schedule_ref": schedule_ref});
                self.cancel(&hints, canceled_at.unwrap_or(fallback_time), AnalyticsEventType::ScheduleCanceled, data)
                    .await?;
            }

            WebhookEvent::ScheduleCompleted { schedule_ref } => {
                // Commitment over; the released subscription keeps billing.
                let data = json!({"schedule_ref": schedule_ref});
                let lookup = OrderLookup::ScheduleRef(schedule_ref.clone());
                match self.lookup(&lookup).await? {
                    Some(order) => {
                        tracing::info!(order_id = %order.id, schedule_ref = %schedule_ref, "Commitment phase completed");
                        self.record_for(&order, AnalyticsEventType::ScheduleCompleted, data)
                            .await;
                    }
                    None => {
                        self.record(AnalyticsEvent::new(AnalyticsEventType::ScheduleCompleted, data))
                            .await;
                    }
                }
            }

            WebhookEvent::ChargeRefunded {
                charge_ref,
                transaction_ref,
                customer_ref,
                amount_refunded,
                fully_refunded,
            } => {
                let data = json!({
                    "charge_ref": charge_ref,
                    "transaction_ref": transaction_ref,
                    "amount_refunded": amount_refunded,
                    "fully_refunded": fully_refunded,
                });

                let mut order = None;
                let lookups = [
                    transaction_ref.map(OrderLookup::TransactionRef),
                    customer_ref.map(OrderLookup::CustomerRef),
                ];
                for lookup in lookups.iter().flatten() {
                    order = self.lookup(lookup).await?;
                    if order.is_some() {
                        break;
                    }
                }

                let Some(mut order) = order else {
                    tracing::warn!(charge_ref = %charge_ref, "No order for refunded charge");
                    self.record(AnalyticsEvent::new(AnalyticsEventType::ChargeRefunded, data))
                        .await;
                    return Ok(());
                };

                if fully_refunded {
                    order.mark_refunded();
                    self.save(&order).await?;
                    tracing::info!(order_id = %order.id, charge_ref = %charge_ref, "Order refunded");
                } else {
                    tracing::info!(
                        order_id = %order.id,
                        charge_ref = %charge_ref,
                        amount_refunded,
                        "Partial refund, order status unchanged"
                    );
                }
                self.record_for(&order, AnalyticsEventType::ChargeRefunded, data)
                    .await;
            }

            WebhookEvent::PaymentFailed {
                transaction_ref,
                error_code,
                error_message,
            } => {
                tracing::warn!(
                    transaction_ref = %transaction_ref,
                    error_code = ?error_code,
                    error_message = ?error_message,
                    "Payment attempt failed"
                );
                self.record(AnalyticsEvent::new(
                    AnalyticsEventType::PaymentFailed,
                    json!({
                        "transaction_ref": transaction_ref,
                        "error_code": error_code,
                        "error_message": error_message,
                    }),
                ))
                .await;
            }

            WebhookEvent::Other { event_type } => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event type");
            }
        }
        Ok(())
    }

    /// Fill lookup hints from the subscription an invoice belongs to
    async fn enrich_from_subscription(&self, mut hints: OrderHints) -> OrderHints {
        let Some(subscription_ref) = hints.subscription_ref.clone() else {
            return hints;
        };
        let retrieved = self
            .resilience
            .gateway
            .call("retrieve_subscription", || {
                self.gateway.retrieve_subscription(&subscription_ref)
            })
            .await;
        match retrieved {
            Ok(subscription) => {
                hints.schedule_ref = hints.schedule_ref.or(subscription.schedule_ref);
                hints.customer_ref = hints.customer_ref.or(subscription.customer_ref);
                if hints.submission_id.is_none() {
                    hints.submission_id = subscription.metadata.get("submission_id").cloned();
                }
            }
            Err(e) => {
                tracing::warn!(
                    subscription_ref = %subscription_ref,
                    error = %e,
                    "Could not retrieve subscription, continuing with payload refs"
                );
            }
        }
        hints
    }

    /// Most specific reference first; a customer may own several orders.
    async fn find_order(&self, hints: &OrderHints) -> Result<Option<Order>> {
        let lookups = [
            hints.schedule_ref.clone().map(OrderLookup::ScheduleRef),
            hints.subscription_ref.clone().map(OrderLookup::SubscriptionRef),
            hints
                .submission_id
                .clone()
                .map(|id| OrderLookup::Id(OrderId::from_string(id))),
            hints.customer_ref.clone().map(OrderLookup::CustomerRef),
        ];
        for lookup in lookups.iter().flatten() {
            if let Some(order) = self.lookup(lookup).await? {
                return Ok(Some(order));
            }
        }
        Ok(None)
    }

    async fn require_order(&self, envelope: &GatewayEvent, hints: &OrderHints) -> Result<Order> {
        self.find_order(hints)
            .await?
            .ok_or_else(|| PaymentError::WebhookHandler {
                event_id: envelope.id.clone(),
                message: format!("no order found for {} ({hints:?})", envelope.event_type),
            })
    }

    async fn lookup(&self, lookup: &OrderLookup) -> Result<Option<Order>> {
        self.resilience
            .datastore
            .call("find_order", || async {
                self.orders.find(lookup).await.map_err(PaymentError::from)
            })
            .await
    }

    async fn save(&self, order: &Order) -> Result<()> {
        self.resilience
            .datastore
            .call("update_order", || async {
                self.orders.update(order).await.map_err(PaymentError::from)
            })
            .await
    }

    /// Mark paid unless a refund already closed the order
    async fn settle(&self, order: &mut Order, receipt: PaymentReceipt) -> Result<()> {
        if order.status == OrderStatus::Refunded {
            tracing::info!(order_id = %order.id, "Order already refunded, ignoring late payment event");
            return Ok(());
        }
        order.mark_paid(receipt);
        self.save(order).await
    }

    async fn cancel(
        &self,
        hints: &OrderHints,
        at: DateTime<Utc>,
        analytics_type: AnalyticsEventType,
        data: serde_json::Value,
    ) -> Result<()> {
        let Some(mut order) = self.find_order(hints).await? else {
            tracing::info!(hints = ?hints, "No order for canceled subscription, ignoring");
            self.record(AnalyticsEvent::new(analytics_type, data)).await;
            return Ok(());
        };
        order.mark_canceled(at);
        self.save(&order).await?;
        tracing::info!(order_id = %order.id, canceled_at = %at, "Subscription canceled");
        self.record_for(&order, analytics_type, data).await;
        Ok(())
    }

    async fn record_for(&self, order: &Order, event_type: AnalyticsEventType, data: serde_json::Value) {
        let mut data = data;
        if let Some(fields) = data.as_object_mut() {
            fields.insert("order_id".into(), json!(order.id.as_str()));
        }
        self.record(AnalyticsEvent::new(event_type, data).for_session(order.session_id.clone()))
            .await;
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
