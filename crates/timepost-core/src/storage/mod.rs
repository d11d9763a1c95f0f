//! Persistent deduplication store.
//!
//! One [`DeliveryRecord`] per event id. Writes follow a one-way state
//! machine: a record may be (re)marked `InProgress` or resolved to a
//! terminal status only while it is absent or still `InProgress`, and `sent`
//! only ever flips from false to true on a resolved record. Writers learn
//! whether their write applied from the returned `bool`, so concurrent
//! resolutions of the same id cannot overwrite each other.
//!
//! Storage errors propagate unchanged; nothing here retries.

use std::{fmt, future::Future, pin::Pin};

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{DeliveryRecord, EventId, LocalStatus, Outcome},
};

mod memory;
mod sqlite;

pub use memory::InMemoryDedupStore;
pub use sqlite::SqliteDedupStore;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations needed for exactly-once delivery.
pub trait DedupStore: Send + Sync + fmt::Debug + 'static {
    /// Point lookup.
    fn lookup(&self, id: EventId) -> StoreFuture<'_, Option<DeliveryRecord>>;

    /// Inserts or updates the status of `id`.
    ///
    /// Returns false when the record is already terminal and the write was
    /// refused.
    fn upsert(
        &self,
        id: EventId,
        status: LocalStatus,
        message: Option<String>,
    ) -> StoreFuture<'_, bool>;

    /// Resolves `id` with a full outcome, keeping it for replay and reporting.
    ///
    /// Same guard as [`DedupStore::upsert`].
    fn record_outcome(&self, id: EventId, outcome: Outcome) -> StoreFuture<'_, bool>;

    /// Marks `id` as dispatched. Refused once the record is terminal.
    fn mark_in_progress(&self, id: EventId) -> StoreFuture<'_, bool> {
        self.upsert(id, LocalStatus::InProgress, None)
    }

    /// Every terminal record not yet acknowledged by the remote service,
    /// oldest first.
    fn pending_status_reports(&self) -> StoreFuture<'_, Vec<(EventId, Outcome)>>;

    /// Flags a terminal record as reported. Returns false when there was no
    /// terminal record for `id`.
    fn mark_sent(&self, id: EventId) -> StoreFuture<'_, bool>;

    /// Deletes reported records last updated before `cutoff`.
    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64>;

    /// Verifies the backing storage is reachable.
    fn health_check(&self) -> StoreFuture<'_, ()>;
}

/// Whether a write for a new status may replace a record in `current`.
pub(crate) fn write_allowed(current: Option<LocalStatus>) -> bool {
    !matches!(current, Some(status) if status.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_records_refuse_writes() {
        assert!(write_allowed(None));
        assert!(write_allowed(Some(LocalStatus::InProgress)));
        assert!(!write_allowed(Some(LocalStatus::Success)));
        assert!(!write_allowed(Some(LocalStatus::TransientFailure)));
        assert!(!write_allowed(Some(LocalStatus::PermanentFailure)));
    }
}
