//! Webhook Idempotency Ledger
//!
//! One row per gateway event id. The unique key on `event_id` is the only
//! thing that keeps two deliveries of the same event from both running a
//! handler, so implementations must reject duplicates inside a single atomic
//! insert rather than with a read followed by a write.
//!
//! A row left in `processing` by a delivery that never finished (process
//! crash, request cancelled mid-handler, terminal write lost) is reclaimable
//! once its lease has run out, so the gateway's redelivery still gets handled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{Result, StoreError};

/// Processing state of a ledger row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Processing,
    Completed,
    Failed,
}

impl LedgerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A ledger row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    /// Gateway-assigned event id (unique)
    pub event_id: String,

    pub event_type: String,

    pub status: LedgerStatus,

    /// Handler failure, when `status` is `Failed`
    pub error_message: Option<String>,

    /// Deliveries that reached the handler
    pub attempts: u32,

    /// Start of the current attempt; the lease on a `processing` row runs from here
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookEventRecord {
    /// Fresh row in `processing`
    pub fn processing(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            status: LedgerStatus::Processing,
            error_message: None,
            attempts: 1,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Idempotency ledger storage. Rows are never deleted.
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Atomically insert a `processing` row. A duplicate `event_id` must fail
    /// with [`StoreError::UniqueViolation`].
    async fn insert(&self, record: &WebhookEventRecord) -> Result<()>;

    /// Atomically move a row back to `processing` for another attempt. Only
    /// `failed` rows and `processing` rows started before `stale_before` are
    /// reclaimable; `false` means someone else holds the row or it is done.
    async fn reclaim(&self, event_id: &str, stale_before: DateTime<Utc>) -> Result<bool>;

    /// Record the handler outcome
    async fn finish(&self, event_id: &str, status: LedgerStatus, error: Option<String>) -> Result<()>;

    async fn get(&self, event_id: &str) -> Result<Option<WebhookEventRecord>>;
}

/// In-memory ledger (for development/testing)
#[derive(Default)]
pub struct MemoryWebhookLedger {
    rows: Mutex<HashMap<String, WebhookEventRecord>>,
}

impl MemoryWebhookLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl WebhookLedger for MemoryWebhookLedger {
    async fn insert(&self, record: &WebhookEventRecord) -> Result<()> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&record.event_id) {
            return Err(StoreError::UniqueViolation(record.event_id.clone()));
        }
        rows.insert(record.event_id.clone(), record.clone());
        Ok(())
    }

    async fn reclaim(&self, event_id: &str, stale_before: DateTime<Utc>) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(event_id)
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;

        let reclaimable = match row.status {
            LedgerStatus::Failed => true,
            LedgerStatus::Processing => row.started_at < stale_before,
            LedgerStatus::Completed => false,
        };
        if reclaimable {
            row.status = LedgerStatus::Processing;
            row.error_message = None;
            row.attempts = row.attempts.saturating_add(1);
            row.started_at = Utc::now();
            row.completed_at = None;
        }
        Ok(reclaimable)
    }

    async fn finish(&self, event_id: &str, status: LedgerStatus, error: Option<String>) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(event_id)
            .ok_or_else(|| StoreError::NotFound(event_id.to_string()))?;
        row.status = status;
        row.error_message = error;
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<WebhookEventRecord>> {
        Ok(self.rows.lock().await.get(event_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_duplicate_insert_is_a_unique_violation() {
        let ledger = MemoryWebhookLedger::new();
        let record = WebhookEventRecord::processing("evt_1", "invoice.paid");

        ledger.insert(&record).await.unwrap();
        let err = ledger.insert(&record).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_admit_exactly_one() {
        let ledger = Arc::new(MemoryWebhookLedger::new());
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    ledger
                        .insert(&WebhookEventRecord::processing("evt_race", "charge.refunded"))
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut admitted = 0;
        for task in futures::future::join_all(tasks).await {
            if task.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_failed_rows_can_be_reclaimed_once() {
        let ledger = MemoryWebhookLedger::new();
        let now = Utc::now();
        ledger
            .insert(&WebhookEventRecord::processing("evt_2", "invoice.paid"))
            .await
            .unwrap();

        assert!(!ledger.reclaim("evt_2", now - Duration::minutes(5)).await.unwrap());

        ledger
            .finish("evt_2", LedgerStatus::Failed, Some("order not found".into()))
            .await
            .unwrap();
        let stale_before = Utc::now() - Duration::minutes(5);
        assert!(ledger.reclaim("evt_2", stale_before).await.unwrap());
        assert!(
            !ledger.reclaim("evt_2", stale_before).await.unwrap(),
            "second reclaim must lose"
        );

        let row = ledger.get("evt_2").await.unwrap().unwrap();
        assert_eq!(row.status, LedgerStatus::Processing);
        assert_eq!(row.attempts, 2);
        assert!(row.error_message.is_none());

        ledger.finish("evt_2", LedgerStatus::Completed, None).await.unwrap();
        assert!(!ledger.reclaim("evt_2", Utc::now() + Duration::minutes(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_processing_row_is_reclaimable_after_its_lease() {
        let ledger = MemoryWebhookLedger::new();
        let record = WebhookEventRecord {
            started_at: Utc::now() - Duration::minutes(10),
            ..WebhookEventRecord::processing("evt_stuck", "invoice.paid")
        };
        ledger.insert(&record).await.unwrap();

        let lease = Duration::minutes(5);
        assert!(ledger.reclaim("evt_stuck", Utc::now() - lease).await.unwrap());

        // The reclaimed attempt holds a fresh lease.
        assert!(!ledger.reclaim("evt_stuck", Utc::now() - lease).await.unwrap());
        let row = ledger.get("evt_stuck").await.unwrap().unwrap();
        assert_eq!(row.attempts, 2);
        assert!(row.started_at > record.started_at);
    }

    #[tokio::test]
    async fn test_reclaim_of_unknown_event_is_not_found() {
        let ledger = MemoryWebhookLedger::new();
        let err = ledger.reclaim("evt_missing", Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
