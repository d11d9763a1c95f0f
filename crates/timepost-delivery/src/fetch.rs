//! Long-poll transport.
//!
//! The fetch loop pulls a batch of events, answers already-resolved ones from
//! the dedup store by re-reporting them, and queues the rest on the
//! single-slot worker. Each loop iteration then waits, bounded, for the
//! worker to catch up before fetching again.
//!
//! Fetch failures are retried with [`RetryPolicy`]. Once the policy gives up
//! the failure is logged and the loop carries on with the next iteration.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use timepost_core::{
    Clock, CoreError, DedupStore, Event, EventId, Handler, InFlight, Outcome, RunnerHealth,
    Transport,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    remote::RemoteClient,
    reporter::StatusReporter,
    retry::{RetryDecision, RetryPolicy},
    stats::SharedStats,
    worker::{DeliveryWorker, Job, WorkerHandle},
};

/// Largest batch the remote service serves.
pub const MAX_BATCH_LIMIT: usize = 25;

/// Tuning for [`FetchClient`].
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Events requested per fetch, 1 to 25.
    pub batch_limit: usize,
    /// Backoff for failed fetches.
    pub retry_policy: RetryPolicy,
    /// Pause after a fetch cycle failed for good.
    pub error_pause: Duration,
    /// Pause after an empty batch.
    pub idle_interval: Duration,
    /// How often the pacing wait re-checks the worker.
    pub pacing_interval: Duration,
    /// Longest pacing wait before fetching anyway.
    pub max_pacing_wait: Duration,
    /// Age of the last successful cycle at which the loop is unhealthy.
    pub unhealthy_after: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_limit: MAX_BATCH_LIMIT,
            retry_policy: RetryPolicy::fetch(),
            error_pause: Duration::from_secs(10),
            idle_interval: Duration::from_secs(1),
            pacing_interval: Duration::from_millis(500),
            max_pacing_wait: Duration::from_secs(30),
            unhealthy_after: Duration::from_secs(600),
        }
    }
}

impl FetchConfig {
    /// Checks the batch limit range.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_LIMIT).contains(&self.batch_limit) {
            return Err(DeliveryError::configuration(format!(
                "batch_limit must be between 1 and {MAX_BATCH_LIMIT}, got {}",
                self.batch_limit
            )));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(DeliveryError::configuration("retry_policy.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// What one dispatch pass did with a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Events queued for the handler.
    pub dispatched: usize,
    /// Resolved events re-reported instead of handled.
    pub reported: usize,
    /// Events already queued or being handled by this process.
    pub skipped: usize,
}

struct Shared {
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn DedupStore>,
    handler: Arc<dyn Handler>,
    reporter: Arc<StatusReporter>,
    stats: SharedStats,
    config: FetchConfig,
    clock: Arc<dyn Clock>,
    health: Arc<RunnerHealth>,
    in_flight: InFlight,
    cancellation_token: CancellationToken,
    running: AtomicBool,
    worker: Mutex<Option<WorkerHandle>>,
}

/// Pull-mode transport.
pub struct FetchClient {
    shared: Arc<Shared>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchClient")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl FetchClient {
    /// Creates a stopped fetch client.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` when `config` is out of range.
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn DedupStore>,
        handler: Arc<dyn Handler>,
        reporter: Arc<StatusReporter>,
        stats: SharedStats,
        config: FetchConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let health = Arc::new(RunnerHealth::new(clock.clone(), config.unhealthy_after));

        Ok(Self {
            shared: Arc::new(Shared {
                remote,
                store,
                handler,
                reporter,
                stats,
                config,
                clock,
                health,
                in_flight: InFlight::new(),
                cancellation_token: CancellationToken::new(),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
            loop_handle: Mutex::new(None),
        })
    }

    /// Health of the fetch loop.
    pub fn health(&self) -> Arc<RunnerHealth> {
        self.shared.health.clone()
    }

    /// Jobs queued on or running in the worker.
    pub async fn outstanding(&self) -> usize {
        self.shared.worker.lock().await.as_ref().map_or(0, WorkerHandle::outstanding)
    }

    /// Runs one fetch-and-dispatch cycle without pacing. Requires a started
    /// client for dispatched events to be handled.
    pub async fn run_cycle(&self) -> Result<DispatchSummary> {
        self.shared.run_cycle().await
    }
}

impl Shared {
    async fn run_loop(self: Arc<Self>) {
        info!(batch_limit = self.config.batch_limit, "fetch loop starting");

        while !self.cancellation_token.is_cancelled() {
            let pause = match self.run_cycle().await {
                Ok(summary) => {
                    self.health.record_success();
                    if summary.dispatched > 0 {
                        self.wait_for_worker().await;
                        None
                    } else {
                        Some(self.config.idle_interval)
                    }
                },
                Err(DeliveryError::ShutdownRequested) => break,
                Err(e) => {
                    error!(error = %e, category = %e.category(), "fetch cycle failed");
                    Some(self.config.error_pause)
                },
            };

            if let Some(pause) = pause {
                tokio::select! {
                    () = self.clock.sleep(pause) => {},
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!("fetch loop stopped");
    }

    async fn run_cycle(&self) -> Result<DispatchSummary> {
        let events = self.fetch_with_backoff().await?;
        if events.is_empty() {
            return Ok(DispatchSummary::default());
        }
        self.stats.write().await.received += events.len() as u64;
        self.dispatch(events).await
    }

    async fn fetch_with_backoff(&self) -> Result<Vec<Event>> {
        let policy = &self.config.retry_policy;
        let mut attempt = 1;
        let mut previous_delay = Duration::ZERO;

        loop {
            let error = tokio::select! {
                result = self.remote.fetch(self.config.batch_limit) => match result {
                    Ok(events) => return Ok(events),
                    Err(e) => e,
                },
                () = self.cancellation_token.cancelled() => {
                    return Err(DeliveryError::ShutdownRequested);
                },
            };

            match policy.decide(attempt, &error) {
                RetryDecision::Retry { delay } => {
                    // Delays never shrink within one backoff run.
                    let delay = delay.max(previous_delay);
                    previous_delay = delay;
                    warn!(
                        attempt,
                        delay_seconds = delay.as_secs(),
                        error = %error,
                        "fetch failed, backing off"
                    );
                    tokio::select! {
                        () = self.clock.sleep(delay) => {},
                        () = self.cancellation_token.cancelled() => {
                            return Err(DeliveryError::ShutdownRequested);
                        },
                    }
                    attempt += 1;
                },
                RetryDecision::GiveUp { reason } if error.is_retryable() => {
                    debug!(reason, "fetch backoff exhausted");
                    return Err(DeliveryError::retries_exhausted(attempt, &error));
                },
                RetryDecision::GiveUp { .. } => return Err(error),
            }
        }
    }

    async fn dispatch(&self, events: Vec<Event>) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary::default();

        // Resolved events only need their status re-reported.
        let mut pending = Vec::with_capacity(events.len());
        for event in events {
            match self.store.lookup(event.id.clone()).await? {
                Some(record) if record.is_terminal() => {
                    self.report_resolved(event.id, record.resolved_outcome());
                    summary.reported += 1;
                },
                _ => pending.push(event),
            }
        }

        for event in pending {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            let id = event.id.clone();

            let Some(claim) = self.in_flight.try_acquire(&id) else {
                debug!(event_id = %id, "event already being handled, skipping redelivery");
                summary.skipped += 1;
                continue;
            };

            // Resolved between the partition above and now.
            if let Some(record) = self.store.lookup(id.clone()).await? {
                if record.is_terminal() {
                    self.report_resolved(id, record.resolved_outcome());
                    summary.reported += 1;
                    continue;
                }
            }

            if !self.store.mark_in_progress(id.clone()).await? {
                debug!(event_id = %id, "event resolved during dispatch");
                summary.skipped += 1;
                continue;
            }

            let worker = self.worker.lock().await;
            let Some(worker) = worker.as_ref() else {
                warn!(event_id = %id, "worker not running, leaving event for redelivery");
                break;
            };
            if worker.submit(Job { event, claim }).is_err() {
                warn!(event_id = %id, "worker stopped, leaving event for redelivery");
                break;
            }
            summary.dispatched += 1;
        }

        debug!(
            dispatched = summary.dispatched,
            reported = summary.reported,
            skipped = summary.skipped,
            "batch dispatched"
        );
        Ok(summary)
    }

    fn report_resolved(&self, id: EventId, outcome: Option<Outcome>) {
        match outcome {
            Some(outcome) => {
                debug!(event_id = %id, "event already resolved, re-reporting status");
                self.reporter.report_now(id, outcome);
            },
            None => warn!(event_id = %id, "resolved record has no outcome to report"),
        }
    }

    async fn wait_for_worker(&self) {
        let started = self.clock.now();
        loop {
            let outstanding =
                self.worker.lock().await.as_ref().map_or(0, WorkerHandle::outstanding);
            if outstanding == 0 {
                return;
            }
            if self.clock.now().saturating_duration_since(started) >= self.config.max_pacing_wait {
                debug!(outstanding, "worker still busy, fetching next batch anyway");
                return;
            }
            tokio::select! {
                () = self.clock.sleep(self.config.pacing_interval) => {},
                () = self.cancellation_token.cancelled() => return,
            }
        }
    }
}

#[async_trait]
impl Transport for FetchClient {
    fn name(&self) -> &str {
        "long-poll"
    }

    async fn start(&self) -> timepost_core::Result<()> {
        let mut loop_handle = self.loop_handle.lock().await;
        if loop_handle.is_some() {
            warn!("fetch client already started");
            return Ok(());
        }
        if self.shared.cancellation_token.is_cancelled() {
            return Err(CoreError::transport("fetch client was stopped and cannot restart"));
        }

        let worker = DeliveryWorker::new(
            self.shared.store.clone(),
            self.shared.handler.clone(),
            self.shared.reporter.clone(),
            self.shared.stats.clone(),
        );
        *self.shared.worker.lock().await = Some(worker.spawn());
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        *loop_handle = Some(tokio::spawn(async move {
            shared.clone().run_loop().await;
            shared.running.store(false, Ordering::Release);
        }));
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    async fn stop(&self, timeout: Duration) -> timepost_core::Result<()> {
        info!(timeout_seconds = timeout.as_secs(), "stopping fetch client");
        self.shared.cancellation_token.cancel();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "fetch loop terminated abnormally");
            }
        }

        let drained = match self.shared.worker.lock().await.take() {
            Some(worker) => worker.shutdown(timeout).await,
            None => true,
        };
        self.shared.running.store(false, Ordering::Release);

        if drained {
            info!("fetch client stopped");
            Ok(())
        } else {
            Err(CoreError::ShutdownTimeout { timeout })
        }
    }

    async fn is_healthy(&self) -> bool {
        self.is_running() && self.shared.health.is_healthy()
    }
}
