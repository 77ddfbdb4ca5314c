//! Analytics Log
//!
//! Append-only event sink. Callers treat writes as fire-and-forget; the
//! checkout path additionally counts `payment_attempt` rows to throttle
//! repeated attempts from one session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::session::SessionId;

/// Kinds of recorded events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEventType {
    PaymentAttempt,
    PaymentSucceeded,
    PaymentFailed,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    ScheduleCompleted,
    ScheduleCanceled,
    ChargeRefunded,
}

impl AnalyticsEventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PaymentAttempt => "payment_attempt",
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::SubscriptionCreated => "subscription_created",
            Self::SubscriptionUpdated => "subscription_updated",
            Self::SubscriptionDeleted => "subscription_deleted",
            Self::ScheduleCompleted => "schedule_completed",
            Self::ScheduleCanceled => "schedule_canceled",
            Self::ChargeRefunded => "charge_refunded",
        }
    }
}

/// A recorded event
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub session_id: Option<SessionId>,
    pub event_type: AnalyticsEventType,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AnalyticsEvent {
    pub fn new(event_type: AnalyticsEventType, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: None,
            event_type,
            data,
            created_at: Utc::now(),
        }
    }

    pub fn for_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Analytics sink
#[async_trait]
pub trait AnalyticsLog: Send + Sync {
    async fn record(&self, event: AnalyticsEvent) -> Result<()>;

    /// Events of `event_type` for a session at or after `since`
    async fn count_since(
        &self,
        session_id: &SessionId,
        event_type: AnalyticsEventType,
        since: DateTime<Utc>,
    ) -> Result<u64>;
}

/// In-memory analytics log (for development/testing)
#[derive(Default)]
pub struct MemoryAnalyticsLog {
    events: RwLock<Vec<AnalyticsEvent>>,
}

impl MemoryAnalyticsLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub async fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.read().await.clone()
    }

    pub async fn count_of(&self, event_type: AnalyticsEventType) -> usize {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl AnalyticsLog for MemoryAnalyticsLog {
    async fn record(&self, event: AnalyticsEvent) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn count_since(
        &self,
        session_id: &SessionId,
        event_type: AnalyticsEventType,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let events = self.events.read().await;
        let count = events
            .iter()
            .filter(|e| {
                e.event_type == event_type
                    && e.session_id.as_ref() == Some(session_id)
                    && e.created_at >= since
            })
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}
