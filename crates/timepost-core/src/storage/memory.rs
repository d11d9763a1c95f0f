//! In-memory dedup store for tests and ephemeral runs.
//!
//! Same state machine as the SQLite store, plus failure injection so callers
//! can exercise storage outages.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{write_allowed, DedupStore, StoreFuture};
use crate::{
    error::{CoreError, Result},
    models::{DeliveryRecord, EventId, LocalStatus, Outcome},
    time::{Clock, RealClock},
};

/// Dedup store kept in a `HashMap`.
#[derive(Debug, Clone)]
pub struct InMemoryDedupStore {
    records: Arc<RwLock<HashMap<EventId, DeliveryRecord>>>,
    failure: Arc<RwLock<Option<String>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new(Arc::new(RealClock::new()))
    }
}

impl InMemoryDedupStore {
    /// Creates an empty store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            failure: Arc::new(RwLock::new(None)),
            clock,
        }
    }

    /// Makes every operation fail with a database error until cleared.
    pub async fn inject_failure(&self, message: impl Into<String>) {
        *self.failure.write().await = Some(message.into());
    }

    /// Clears an injected failure.
    pub async fn clear_failure(&self) {
        *self.failure.write().await = None;
    }

    /// Inserts a record as-is, bypassing the state machine.
    pub async fn insert_record(&self, record: DeliveryRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    /// Snapshot of every record.
    pub async fn records(&self) -> Vec<DeliveryRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    async fn check_failure(&self) -> Result<()> {
        match self.failure.read().await.as_ref() {
            Some(message) => Err(CoreError::Database(message.clone())),
            None => Ok(()),
        }
    }

    async fn write(
        &self,
        id: EventId,
        status: LocalStatus,
        message: Option<String>,
        outcome: Option<Outcome>,
    ) -> Result<bool> {
        self.check_failure().await?;
        let now = self.clock.now_utc();
        let mut records = self.records.write().await;

        let current = records.get(&id).map(|r| r.status);
        if !write_allowed(current) {
            return Ok(false);
        }

        let record = records.entry(id.clone()).or_insert_with(|| DeliveryRecord {
            id,
            status,
            sent: false,
            message: None,
            outcome: None,
            received_at: now,
            created_at: now,
            updated_at: now,
        });
        if status == LocalStatus::InProgress {
            record.received_at = now;
        }
        record.status = status;
        record.message = message;
        record.outcome = outcome;
        record.updated_at = now;
        Ok(true)
    }
}

impl DedupStore for InMemoryDedupStore {
    fn lookup(&self, id: EventId) -> StoreFuture<'_, Option<DeliveryRecord>> {
        Box::pin(async move {
            self.check_failure().await?;
            Ok(self.records.read().await.get(&id).cloned())
        })
    }

    fn upsert(
        &self,
        id: EventId,
        status: LocalStatus,
        message: Option<String>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(self.write(id, status, message, None))
    }

    fn record_outcome(&self, id: EventId, outcome: Outcome) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let message = outcome.message().map(str::to_string);
            self.write(id, outcome.local_status(), message, Some(outcome)).await
        })
    }

    fn pending_status_reports(&self) -> StoreFuture<'_, Vec<(EventId, Outcome)>> {
        Box::pin(async move {
            self.check_failure().await?;
            let records = self.records.read().await;
            let mut pending: Vec<&DeliveryRecord> =
                records.values().filter(|r| r.is_terminal() && !r.sent).collect();
            pending.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));

            Ok(pending
                .into_iter()
                .filter_map(|r| r.resolved_outcome().map(|o| (r.id.clone(), o)))
                .collect())
        })
    }

    fn mark_sent(&self, id: EventId) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check_failure().await?;
            let now = self.clock.now_utc();
            let mut records = self.records.write().await;
            match records.get_mut(&id) {
                Some(record) if record.is_terminal() => {
                    if !record.sent {
                        record.sent = true;
                        record.updated_at = now;
                    }
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.check_failure().await?;
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, r| !(r.sent && r.is_terminal() && r.updated_at < cutoff));
            Ok(u64::try_from(before - records.len()).unwrap_or(u64::MAX))
        })
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        Box::pin(self.check_failure())
    }
}
