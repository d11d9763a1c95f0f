//! SQLite-backed dedup store.

use std::{str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    FromRow,
};
use tracing::{debug, warn};

use super::{DedupStore, StoreFuture};
use crate::{
    error::{CoreError, Result},
    models::{DeliveryRecord, EventId, LocalStatus, Outcome},
    time::Clock,
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS delivery_records (
    id          TEXT PRIMARY KEY NOT NULL,
    status      TEXT NOT NULL,
    sent        INTEGER NOT NULL DEFAULT 0,
    message     TEXT,
    outcome     TEXT,
    received_at TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_delivery_records_pending ON delivery_records (sent, status);
";

// Resolution and re-dispatch share one guarded upsert: the DO UPDATE only
// fires while the existing row is still in progress.
const UPSERT: &str = r"
INSERT INTO delivery_records (id, status, sent, message, outcome, received_at, created_at, updated_at)
VALUES (?1, ?2, 0, ?3, ?4, ?5, ?5, ?5)
ON CONFLICT (id) DO UPDATE SET
    status = excluded.status,
    message = excluded.message,
    outcome = excluded.outcome,
    received_at = CASE
        WHEN excluded.status = 'in_progress' THEN excluded.received_at
        ELSE delivery_records.received_at
    END,
    updated_at = excluded.updated_at
WHERE delivery_records.status = 'in_progress'
";

#[derive(Debug, FromRow)]
struct RecordRow {
    id: EventId,
    status: LocalStatus,
    sent: bool,
    message: Option<String>,
    outcome: Option<String>,
    received_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for DeliveryRecord {
    type Error = CoreError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let outcome = row.outcome.as_deref().map(serde_json::from_str::<Outcome>).transpose()?;
        Ok(Self {
            id: row.id,
            status: row.status,
            sent: row.sent,
            message: row.message,
            outcome,
            received_at: row.received_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Dedup store persisted in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteDedupStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteDedupStore {
    /// Wraps an existing pool. Call [`SqliteDedupStore::migrate`] before use.
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Opens (creating if needed) the database at `database_url` and
    /// applies the schema.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let store = Self::new(pool, clock);
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database that lives as long as the store.
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool, clock);
        store.migrate().await?;
        Ok(store)
    }

    /// Creates the table and index if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("delivery_records schema ready");
        Ok(())
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn lookup_impl(&self, id: EventId) -> Result<Option<DeliveryRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r"
            SELECT id, status, sent, message, outcome, received_at, created_at, updated_at
            FROM delivery_records
            WHERE id = ?1
            ",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeliveryRecord::try_from).transpose()
    }

    async fn write_impl(
        &self,
        id: EventId,
        status: LocalStatus,
        message: Option<String>,
        outcome: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now_utc();
        let result = sqlx::query(UPSERT)
            .bind(id.as_str())
            .bind(status.as_str())
            .bind(message)
            .bind(outcome)
            .bind(now)
            .execute(&self.pool)
            .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!(event_id = %id, status = %status, "record already resolved, write refused");
        }
        Ok(applied)
    }

    async fn pending_impl(&self) -> Result<Vec<(EventId, Outcome)>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r"
            SELECT id, status, sent, message, outcome, received_at, created_at, updated_at
            FROM delivery_records
            WHERE sent = 0 AND status != 'in_progress'
            ORDER BY updated_at ASC, id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let record = match DeliveryRecord::try_from(row) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable delivery record");
                    continue;
                },
            };
            if let Some(outcome) = record.resolved_outcome() {
                pending.push((record.id, outcome));
            }
        }
        Ok(pending)
    }

    async fn mark_sent_impl(&self, id: EventId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE delivery_records
            SET sent = 1, updated_at = ?2
            WHERE id = ?1 AND status != 'in_progress' AND sent = 0
            ",
        )
        .bind(id.as_str())
        .bind(self.clock.now_utc())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Already-sent terminal records still count as marked.
        Ok(self.lookup_impl(id).await?.is_some_and(|r| r.is_terminal() && r.sent))
    }

    async fn purge_impl(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM delivery_records
            WHERE sent = 1 AND status != 'in_progress' AND updated_at < ?1
            ",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl DedupStore for SqliteDedupStore {
    fn lookup(&self, id: EventId) -> StoreFuture<'_, Option<DeliveryRecord>> {
        Box::pin(self.lookup_impl(id))
    }

    fn upsert(
        &self,
        id: EventId,
        status: LocalStatus,
        message: Option<String>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(self.write_impl(id, status, message, None))
    }

    fn record_outcome(&self, id: EventId, outcome: Outcome) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let encoded = serde_json::to_string(&outcome)?;
            let message = outcome.message().map(str::to_string);
            self.write_impl(id, outcome.local_status(), message, Some(encoded)).await
        })
    }

    fn pending_status_reports(&self) -> StoreFuture<'_, Vec<(EventId, Outcome)>> {
        Box::pin(self.pending_impl())
    }

    fn mark_sent(&self, id: EventId) -> StoreFuture<'_, bool> {
        Box::pin(self.mark_sent_impl(id))
    }

    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(self.purge_impl(cutoff))
    }

    fn health_check(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
    }
}
