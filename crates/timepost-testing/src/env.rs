use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use timepost_api::{AppState, ConnectorInfo};
use timepost_core::{
    DedupStore, DeliveryRecord, EventId, InFlight, LocalStatus, SqliteDedupStore, TestClock,
};
use timepost_delivery::{
    DeliveryStats, FetchClient, FetchConfig, RetryPolicy, SharedStats, StatusReporter,
};

use crate::{MockRemoteClient, RecordingHandler};

/// Everything one delivery test needs, wired together.
///
/// The store is an in-memory SQLite database on `clock`, so record
/// timestamps follow virtual time.
pub struct TestEnv {
    /// Deterministic clock shared by the store and the fetch client.
    pub clock: TestClock,
    /// Dedup store under test.
    pub store: Arc<SqliteDedupStore>,
    /// Remote service double.
    pub remote: Arc<MockRemoteClient>,
    /// Handler double.
    pub handler: Arc<RecordingHandler>,
    /// Delivery counters.
    pub stats: SharedStats,
    /// Reporter wired to `remote` and `store`.
    pub reporter: Arc<StatusReporter>,
}

impl TestEnv {
    /// Creates a fresh environment.
    ///
    /// # Errors
    ///
    /// Returns error if the in-memory database cannot be created.
    pub async fn new() -> Result<Self> {
        let clock = TestClock::new();
        let store = Arc::new(
            SqliteDedupStore::in_memory(Arc::new(clock.clone()))
                .await
                .context("failed to create in-memory dedup store")?,
        );
        let remote = Arc::new(MockRemoteClient::new());
        let handler = Arc::new(RecordingHandler::new());
        let stats = DeliveryStats::shared();
        let reporter = Arc::new(StatusReporter::new(remote.clone(), store.clone(), stats.clone(), 4));

        Ok(Self { clock, store, remote, handler, stats, reporter })
    }

    /// Fetch tuning with short pacing, for loops driven by the test clock.
    pub fn fast_fetch_config() -> FetchConfig {
        FetchConfig {
            batch_limit: 25,
            retry_policy: RetryPolicy::fetch(),
            error_pause: Duration::from_secs(10),
            idle_interval: Duration::from_millis(100),
            pacing_interval: Duration::from_millis(50),
            max_pacing_wait: Duration::from_secs(1),
            unhealthy_after: Duration::from_secs(600),
        }
    }

    /// Builds a stopped fetch client over this environment.
    ///
    /// # Errors
    ///
    /// Returns error when `config` is invalid.
    pub fn fetch_client(&self, config: FetchConfig) -> Result<FetchClient> {
        Ok(FetchClient::new(
            self.remote.clone(),
            self.store.clone(),
            self.handler.clone(),
            self.reporter.clone(),
            self.stats.clone(),
            config,
            Arc::new(self.clock.clone()),
        )?)
    }

    /// Builds webhook state over this environment.
    pub fn app_state(&self, caller_key: Option<&str>) -> AppState {
        AppState {
            store: self.store.clone(),
            handler: self.handler.clone(),
            reporter: self.reporter.clone(),
            stats: self.stats.clone(),
            in_flight: InFlight::new(),
            caller_key: caller_key.map(Arc::from),
            connector: Arc::new(ConnectorInfo::default()),
            clock: Arc::new(self.clock.clone()),
        }
    }

    /// Current record for `id`.
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails.
    pub async fn record(&self, id: &str) -> Result<Option<DeliveryRecord>> {
        Ok(self.store.lookup(EventId::from(id)).await?)
    }

    /// Polls until `id` has `status`.
    ///
    /// # Errors
    ///
    /// Returns error when `timeout` passes first or a lookup fails.
    pub async fn wait_for_status(
        &self,
        id: &str,
        status: LocalStatus,
        timeout: Duration,
    ) -> Result<DeliveryRecord> {
        self.wait_for_record(id, timeout, |record| record.status == status)
            .await
            .with_context(|| format!("event {id} never reached {status}"))
    }

    /// Polls until `id` is resolved and reported.
    ///
    /// # Errors
    ///
    /// Returns error when `timeout` passes first or a lookup fails.
    pub async fn wait_for_sent(&self, id: &str, timeout: Duration) -> Result<DeliveryRecord> {
        self.wait_for_record(id, timeout, |record| record.sent)
            .await
            .with_context(|| format!("event {id} was never marked sent"))
    }

    async fn wait_for_record(
        &self,
        id: &str,
        timeout: Duration,
        done: impl Fn(&DeliveryRecord) -> bool,
    ) -> Result<DeliveryRecord> {
        let start = std::time::Instant::now();
        loop {
            let current = self.record(id).await?;
            if let Some(record) = current.as_ref().filter(|record| done(record)) {
                return Ok(record.clone());
            }
            if start.elapsed() > timeout {
                bail!(
                    "timeout after {timeout:?}, current record: {:?}",
                    current.map(|r| (r.status, r.sent))
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
