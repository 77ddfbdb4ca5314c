//! Webhook event parsing

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PaymentError, Result};

/// Raw gateway event envelope
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl GatewayEvent {
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        let event: Self = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::WebhookParse(e.to_string()))?;
        if event.id.is_empty() || event.event_type.is_empty() {
            return Err(PaymentError::WebhookParse("event id and type are required".into()));
        }
        Ok(event)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.created, 0).unwrap_or_else(Utc::now)
    }
}

/// Gateway objects a lookup can start from
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrderHints {
    pub schedule_ref: Option<String>,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    /// Order id stamped into gateway metadata at checkout
    pub submission_id: Option<String>,
}

/// Parsed webhook event
#[derive(Clone, Debug, PartialEq)]
pub enum WebhookEvent {
    /// Invoice settled
    InvoicePaid {
        invoice_ref: String,
        transaction_ref: Option<String>,
        amount_paid: Option<i64>,
        currency: Option<String>,
        paid_at: Option<DateTime<Utc>>,
        hints: OrderHints,
    },

    /// Payment intent settled
    PaymentSucceeded {
        transaction_ref: String,
        amount: Option<i64>,
        currency: Option<String>,
        card_last4: Option<String>,
        hints: OrderHints,
    },

    /// Subscription created or updated
    SubscriptionChanged {
        subscription_ref: String,
        status: String,
        created: bool,
        hints: OrderHints,
    },

    /// Subscription ended
    SubscriptionDeleted {
        subscription_ref: String,
        canceled_at: Option<DateTime<Utc>>,
        hints: OrderHints,
    },

    /// Commitment phase ran out and the schedule released the subscription
    ScheduleCompleted { schedule_ref: String },

    /// Schedule canceled before its end
    ScheduleCanceled {
        schedule_ref: String,
        canceled_at: Option<DateTime<Utc>>,
        hints: OrderHints,
    },

    /// Charge refunded, fully or in part
    ChargeRefunded {
        charge_ref: String,
        transaction_ref: Option<String>,
        customer_ref: Option<String>,
        amount_refunded: i64,
        fully_refunded: bool,
    },

    /// Payment attempt declined; the customer may retry
    PaymentFailed {
        transaction_ref: String,
        error_code: Option<String>,
        error_message: Option<String>,
    },

    /// Unhandled event type
    Other { event_type: String },
}

fn str_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Id of a field that is either an id string or an expanded object
fn ref_field(object: &Value, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(id) => Some(id.clone()),
        Value::Object(inner) => inner.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn time_field(object: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    object
        .pointer(pointer)
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn required_id(object: &Value, what: &str) -> Result<String> {
    str_field(object, "id").ok_or_else(|| PaymentError::WebhookParse(format!("{what} without id")))
}

fn metadata_submission(object: &Value) -> Option<String> {
    object
        .pointer("/metadata/submission_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn subscription_hints(object: &Value, subscription_ref: &str) -> OrderHints {
    OrderHints {
        schedule_ref: ref_field(object, "schedule"),
        customer_ref: ref_field(object, "customer"),
        subscription_ref: Some(subscription_ref.to_string()),
        submission_id: metadata_submission(object),
    }
}

impl WebhookEvent {
    /// Parse a gateway event into our event type
    pub fn parse(event: &GatewayEvent) -> Result<Self> {
        let object = &event.data.object;
        let parsed = match event.event_type.as_str() {
            "invoice.paid" | "invoice.payment_succeeded" => Self::InvoicePaid {
                invoice_ref: required_id(object, "invoice")?,
                transaction_ref: ref_field(object, "payment_intent"),
                amount_paid: object.get("amount_paid").and_then(Value::as_i64),
                currency: str_field(object, "currency"),
                paid_at: time_field(object, "/status_transitions/paid_at"),
                hints: OrderHints {
                    schedule_ref: None,
                    customer_ref: ref_field(object, "customer"),
                    subscription_ref: ref_field(object, "subscription"),
                    submission_id: metadata_submission(object),
                },
            },

            "payment_intent.succeeded" => Self::PaymentSucceeded {
                transaction_ref: required_id(object, "payment intent")?,
                amount: object
                    .get("amount_received")
                    .or_else(|| object.get("amount"))
                    .and_then(Value::as_i64),
                currency: str_field(object, "currency"),
                card_last4: object
                    .pointer("/payment_method/card/last4")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                hints: OrderHints {
                    customer_ref: ref_field(object, "customer"),
                    submission_id: metadata_submission(object),
                    ..OrderHints::default()
                },
            },

            kind @ ("customer.subscription.created" | "customer.subscription.updated") => {
                let subscription_ref = required_id(object, "subscription")?;
                Self::SubscriptionChanged {
                    status: str_field(object, "status").unwrap_or_default(),
                    created: kind.ends_with("created"),
                    hints: subscription_hints(object, &subscription_ref),
                    subscription_ref,
                }
            }

            "customer.subscription.deleted" => {
                let subscription_ref = required_id(object, "subscription")?;
                Self::SubscriptionDeleted {
                    canceled_at: time_field(object, "/canceled_at")
                        .or_else(|| time_field(object, "/ended_at")),
                    hints: subscription_hints(object, &subscription_ref),
                    subscription_ref,
                }
            }

            "subscription_schedule.completed" => Self::ScheduleCompleted {
                schedule_ref: required_id(object, "schedule")?,
            },

            "subscription_schedule.canceled" => {
                let schedule_ref = required_id(object, "schedule")?;
                Self::ScheduleCanceled {
                    canceled_at: time_field(object, "/canceled_at"),
                    hints: OrderHints {
                        schedule_ref: Some(schedule_ref.clone()),
                        customer_ref: ref_field(object, "customer"),
                        subscription_ref: ref_field(object, "subscription"),
                        submission_id: metadata_submission(object),
                    },
                    schedule_ref,
                }
            }

            "charge.refunded" => Self::ChargeRefunded {
                charge_ref: required_id(object, "charge")?,
                transaction_ref: ref_field(object, "payment_intent"),
                customer_ref: ref_field(object, "customer"),
                amount_refunded: object
                    .get("amount_refunded")
                    .and_then(Value::as_i64)
                    .unwrap_or_default(),
                fully_refunded: object
                    .get("refunded")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },

            "payment_intent.payment_failed" => Self::PaymentFailed {
                transaction_ref: required_id(object, "payment intent")?,
                error_code: object
                    .pointer("/last_payment_error/code")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                error_message: object
                    .pointer("/last_payment_error/message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },

            other => Self::Other {
                event_type: other.to_string(),
            },
        };
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, object: Value) -> GatewayEvent {
        GatewayEvent {
            id: "evt_1".into(),
            event_type: event_type.into(),
            created: 1_700_000_000,
            data: EventData { object },
        }
    }

    #[test]
    fn test_invoice_paid_reads_refs_and_amounts() {
        let parsed = WebhookEvent::parse(&event(
            "invoice.paid",
            json!({
                "id": "in_1",
                "customer": "cus_1",
                "subscription": {"id": "sub_1"},
                "payment_intent": "pi_1",
                "amount_paid": 26000,
                "currency": "eur",
                "status_transitions": {"paid_at": 1_700_000_100}
            }),
        ))
        .unwrap();

        let WebhookEvent::InvoicePaid { transaction_ref, amount_paid, paid_at, hints, .. } = parsed else {
            panic!("expected invoice paid");
        };
        assert_eq!(transaction_ref.as_deref(), Some("pi_1"));
        assert_eq!(amount_paid, Some(26000));
        assert_eq!(paid_at.map(|t| t.timestamp()), Some(1_700_000_100));
        assert_eq!(hints.subscription_ref.as_deref(), Some("sub_1"));
        assert_eq!(hints.customer_ref.as_deref(), Some("cus_1"));
    }

    #[test]
    fn test_subscription_events_carry_lookup_hints() {
        let parsed = WebhookEvent::parse(&event(
            "customer.subscription.created",
            json!({
                "id": "sub_1",
                "status": "incomplete",
                "customer": "cus_1",
                "schedule": "sub_sched_1",
                "metadata": {"submission_id": "ord_1"}
            }),
        ))
        .unwrap();
        assert_eq!(
            parsed,
            WebhookEvent::SubscriptionChanged {
                subscription_ref: "sub_1".into(),
                status: "incomplete".into(),
                created: true,
                hints: OrderHints {
                    schedule_ref: Some("sub_sched_1".into()),
                    customer_ref: Some("cus_1".into()),
                    subscription_ref: Some("sub_1".into()),
                    submission_id: Some("ord_1".into()),
                },
            }
        );
    }

    #[test]
    fn test_unknown_types_parse_as_other() {
        let parsed = WebhookEvent::parse(&event("customer.tax_id.created", json!({}))).unwrap();
        assert_eq!(
            parsed,
            WebhookEvent::Other {
                event_type: "customer.tax_id.created".into()
            }
        );
    }

    #[test]
    fn test_known_type_without_id_is_a_parse_error() {
        let err = WebhookEvent::parse(&event("charge.refunded", json!({"amount_refunded": 5}))).unwrap_err();
        assert!(matches!(err, PaymentError::WebhookParse(_)));
    }

    #[test]
    fn test_envelope_requires_id_and_type() {
        assert!(GatewayEvent::from_slice(br#"{"id":"","type":"x","data":{"object":{}}}"#).is_err());
        assert!(GatewayEvent::from_slice(b"not json").is_err());
        let ok = GatewayEvent::from_slice(br#"{"id":"evt_9","type":"x","data":{"object":{}}}"#).unwrap();
        assert_eq!(ok.id, "evt_9");
    }
}
