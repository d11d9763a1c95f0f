//! Process lifecycle: transport, periodic runners and health sweep.
//!
//! The controller owns one optional [`Transport`] and a fixed set of
//! [`Runner`]s, each on its own timer. `start` blocks until a stop is
//! requested, health stays bad past the threshold, or the transport dies.
//! `stop` then tears everything down within `shutdown_timeout`. Work that
//! does not drain in time is fatal: the halt hook runs, which by default
//! exits the process.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use timepost_api::{AppState, WebhookServer};
use timepost_core::{
    Clock, CoreError, DedupStore, HealthAggregator, HealthProvider, InFlight, RealClock, Runner,
    RunnerAction, RunnerHealth, Transport, TransportHealth,
};
use timepost_delivery::{DeliveryStats, FetchClient, RemoteClient, StatusReporter};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::config::{Config, TransportMode};

/// Exit code used when shutdown cannot drain.
pub const HALT_EXIT_CODE: i32 = 70;

/// Called when work fails to drain at shutdown.
pub type HaltHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Logs and exits the process with [`HALT_EXIT_CODE`].
pub fn process_halt() -> HaltHook {
    Arc::new(|reason| {
        error!(reason, exit_code = HALT_EXIT_CODE, "halting process");
        std::process::exit(HALT_EXIT_CODE);
    })
}

/// Lifecycle of a [`Controller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built, not started.
    Created,
    /// Initialising the handler and transport.
    Starting,
    /// Transport and timers running.
    Running,
    /// Tearing down.
    Stopping,
    /// Done. Cannot be restarted.
    Stopped,
}

/// Initial delay and period of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Delay before the first tick.
    pub initial_delay: Duration,
    /// Time between ticks.
    pub period: Duration,
}

impl Schedule {
    /// Creates a schedule.
    pub fn new(initial_delay: Duration, period: Duration) -> Self {
        Self { initial_delay, period }
    }
}

/// Purging of reported records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Reported records older than this are deleted.
    pub max_age: Duration,
    /// When the purge runs.
    pub schedule: Schedule,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 24 * 3600),
            schedule: Schedule::new(Duration::from_secs(60), Duration::from_secs(3600)),
        }
    }
}

/// Timers and bounds of a [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Status report sweep.
    pub status_sweep: Schedule,
    /// Primary handler sync.
    pub sync: Schedule,
    /// Slow handler sync.
    pub slow_sync: Schedule,
    /// Record purging, if enabled.
    pub retention: Option<RetentionPolicy>,
    /// Health sweep period.
    pub health_check_interval: Duration,
    /// Sustained unhealthiness before the controller stops itself.
    pub unhealthy_threshold: Duration,
    /// Bound on draining work at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Config::default().to_controller_config()
    }
}

/// The collaborators a controller drives.
pub struct Components {
    /// Event handler.
    pub handler: Arc<dyn timepost_core::Handler>,
    /// Dedup store.
    pub store: Arc<dyn DedupStore>,
    /// Status reporter shared with the transport.
    pub reporter: Arc<StatusReporter>,
    /// Active transport, if any.
    pub transport: Option<Arc<dyn Transport>>,
    /// Clock for timers and health.
    pub clock: Arc<dyn Clock>,
}

/// Wires transport, runners and health checks together.
pub struct Controller {
    config: ControllerConfig,
    handler: Arc<dyn timepost_core::Handler>,
    reporter: Arc<StatusReporter>,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    runners: Vec<(Arc<Runner>, Schedule)>,
    health: Arc<HealthAggregator>,
    state: Mutex<LifecycleState>,
    cancellation_token: CancellationToken,
    tasks: TaskTracker,
    halt: HaltHook,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state())
            .field("transport", &self.transport.as_ref().map(|t| t.name().to_string()))
            .field("runners", &self.runner_names())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Builds a controller and its runners.
    pub fn new(config: ControllerConfig, components: Components) -> Self {
        let Components { handler, store, reporter, transport, clock } = components;
        let cancellation_token = CancellationToken::new();

        let mut runners = Vec::new();
        let health_for = |schedule: &Schedule| {
            let max_age = config.unhealthy_threshold.max(schedule.period.saturating_mul(2));
            Arc::new(RunnerHealth::new(clock.clone(), max_age))
        };

        let sweep_reporter = reporter.clone();
        runners.push((
            Runner::new(
                "status-report-sweep",
                RunnerAction::task(move || {
                    let reporter = sweep_reporter.clone();
                    async move {
                        reporter.sweep().await?;
                        Ok(())
                    }
                }),
                health_for(&config.status_sweep),
            ),
            config.status_sweep,
        ));

        let sync_handler = handler.clone();
        runners.push((
            Runner::new(
                "sync",
                RunnerAction::task(move || {
                    let handler = sync_handler.clone();
                    async move { handler.sync().await }
                }),
                health_for(&config.sync),
            ),
            config.sync,
        ));

        let slow_sync_handler = handler.clone();
        runners.push((
            Runner::new(
                "slow-sync",
                RunnerAction::task(move || {
                    let handler = slow_sync_handler.clone();
                    async move { handler.slow_sync().await }
                }),
                health_for(&config.slow_sync),
            ),
            config.slow_sync,
        ));

        if let Some(retention) = config.retention {
            let purge_store = store.clone();
            let purge_clock = clock.clone();
            runners.push((
                Runner::new(
                    "retention",
                    RunnerAction::task(move || {
                        let store = purge_store.clone();
                        let clock = purge_clock.clone();
                        async move {
                            let max_age = TimeDelta::from_std(retention.max_age)
                                .context("retention age out of range")?;
                            let purged = store.purge_sent_before(clock.now_utc() - max_age).await?;
                            if purged > 0 {
                                info!(purged, "purged reported records");
                            }
                            Ok(())
                        }
                    }),
                    health_for(&retention.schedule),
                ),
                retention.schedule,
            ));
        }

        let runners: Vec<(Arc<Runner>, Schedule)> =
            runners.into_iter().map(|(runner, schedule)| (Arc::new(runner), schedule)).collect();

        let mut health = HealthAggregator::new(clock.clone(), config.unhealthy_threshold);
        if let Some(transport) = &transport {
            health = health.with_provider(Arc::new(TransportHealth(transport.clone())));
        }
        for (runner, _) in &runners {
            health = health.with_provider(runner.clone() as Arc<dyn HealthProvider>);
        }
        let stop_token = cancellation_token.clone();
        let health = health.on_sustained_failure(Arc::new(move || stop_token.cancel()));

        Self {
            config,
            handler,
            reporter,
            transport,
            clock,
            runners,
            health: Arc::new(health),
            state: Mutex::new(LifecycleState::Created),
            cancellation_token,
            tasks: TaskTracker::new(),
            halt: process_halt(),
        }
    }

    /// Builds the transport selected by `config` and the controller around
    /// it.
    ///
    /// # Errors
    ///
    /// Returns error when the transport configuration is invalid.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn DedupStore>,
        remote: Arc<dyn RemoteClient>,
        handler: Arc<dyn timepost_core::Handler>,
    ) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let stats = DeliveryStats::shared();
        let reporter = Arc::new(StatusReporter::new(
            remote.clone(),
            store.clone(),
            stats.clone(),
            config.max_concurrent_reports,
        ));

        let transport: Option<Arc<dyn Transport>> = match config.transport {
            TransportMode::LongPoll => {
                let client = FetchClient::new(
                    remote,
                    store.clone(),
                    handler.clone(),
                    reporter.clone(),
                    stats,
                    config.to_fetch_config(),
                    clock.clone(),
                )
                .context("invalid long-poll configuration")?;
                Some(Arc::new(client) as Arc<dyn Transport>)
            },
            TransportMode::Webhook => {
                let state = AppState {
                    store: store.clone(),
                    handler: handler.clone(),
                    reporter: reporter.clone(),
                    stats,
                    in_flight: InFlight::new(),
                    caller_key: config.caller_key.as_deref().map(Arc::from),
                    connector: Arc::new(config.connector_info()),
                    clock: clock.clone(),
                };
                let server = WebhookServer::new(config.to_webhook_config()?, state);
                Some(Arc::new(server) as Arc<dyn Transport>)
            },
            TransportMode::None => None,
        };

        Ok(Self::new(
            config.to_controller_config(),
            Components { handler, store, reporter, transport, clock },
        ))
    }

    /// Replaces the hook run when shutdown cannot drain.
    #[must_use]
    pub fn with_halt_hook(mut self, halt: HaltHook) -> Self {
        self.halt = halt;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of the registered runners.
    pub fn runner_names(&self) -> Vec<String> {
        self.runners.iter().map(|(runner, _)| runner.name().to_string()).collect()
    }

    /// Combined health of transport and runners.
    pub fn health(&self) -> Arc<HealthAggregator> {
        self.health.clone()
    }

    /// Makes a blocked `start` return.
    pub fn request_stop(&self) {
        info!("stop requested");
        self.cancellation_token.cancel();
    }

    /// Starts the handler, transport, runners and health sweep, then blocks
    /// until a stop is requested or the transport stops on its own.
    ///
    /// A second call while starting or running returns immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the handler or transport fail to start, or if the
    /// controller was already stopped.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                LifecycleState::Created => *state = LifecycleState::Starting,
                LifecycleState::Starting | LifecycleState::Running => {
                    warn!("controller already running, ignoring start");
                    return Ok(());
                },
                LifecycleState::Stopping | LifecycleState::Stopped => {
                    bail!("controller was stopped and cannot restart");
                },
            }
        }
        info!(
            transport = self.transport.as_ref().map_or("none", |t| t.name()),
            runners = ?self.runner_names(),
            "controller starting"
        );

        if let Err(e) = self.start_components().await {
            self.set_state(LifecycleState::Stopped);
            return Err(e);
        }
        self.set_state(LifecycleState::Running);
        info!("controller running");

        self.wait_until_done().await;
        Ok(())
    }

    async fn start_components(&self) -> Result<()> {
        self.handler.init().await.context("handler initialisation failed")?;
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.start().await {
                // init succeeded, so the handler owns resources to release.
                self.shutdown_handler().await;
                return Err(e)
                    .with_context(|| format!("failed to start {} transport", transport.name()));
            }
        }

        for (runner, schedule) in &self.runners {
            self.tasks.spawn(run_on_schedule(
                runner.clone(),
                *schedule,
                self.clock.clone(),
                self.cancellation_token.clone(),
                self.tasks.clone(),
            ));
        }
        self.tasks.spawn(sweep_health(
            self.health.clone(),
            self.config.health_check_interval,
            self.clock.clone(),
            self.cancellation_token.clone(),
        ));
        Ok(())
    }

    async fn wait_until_done(&self) {
        let Some(transport) = &self.transport else {
            self.cancellation_token.cancelled().await;
            return;
        };
        loop {
            if !transport.is_running() {
                warn!(transport = transport.name(), "transport stopped on its own");
                return;
            }
            tokio::select! {
                () = self.cancellation_token.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(250)) => {},
            }
        }
    }

    /// Stops timers and transport, drains outstanding work and releases the
    /// handler.
    ///
    /// Runs the halt hook when work is still running after
    /// `shutdown_timeout`.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = *state;
            match previous {
                LifecycleState::Stopping | LifecycleState::Stopped => return,
                LifecycleState::Created => *state = LifecycleState::Stopped,
                LifecycleState::Starting | LifecycleState::Running => {
                    *state = LifecycleState::Stopping;
                },
            }
            previous
        };
        if previous == LifecycleState::Created {
            debug!("controller stopped before it started");
            return;
        }

        let timeout = self.config.shutdown_timeout;
        info!(timeout_seconds = timeout.as_secs(), "controller stopping");
        self.cancellation_token.cancel();
        self.tasks.close();

        // One deadline covers every step; each gets only what is left of it.
        let deadline = tokio::time::Instant::now() + timeout;
        let remaining = || deadline.saturating_duration_since(tokio::time::Instant::now());

        let mut drained = true;
        if let Some(transport) = &self.transport {
            match transport.stop(remaining()).await {
                Ok(()) => {},
                Err(CoreError::ShutdownTimeout { .. }) => drained = false,
                Err(e) => error!(transport = transport.name(), error = %e, "transport stop failed"),
            }
        }
        if tokio::time::timeout_at(deadline, self.tasks.wait()).await.is_err() {
            warn!(outstanding = self.tasks.len(), "runners still busy at shutdown");
            drained = false;
        }
        if !self.reporter.shutdown(remaining()).await {
            drained = false;
        }

        if !drained {
            (self.halt)("background work did not drain within the shutdown timeout");
        }

        self.shutdown_handler().await;
        self.set_state(LifecycleState::Stopped);
        info!("controller stopped");
    }

    async fn shutdown_handler(&self) {
        if let Err(e) = self.handler.shutdown().await {
            warn!(error = %format!("{e:#}"), "handler shutdown failed");
        }
    }

    fn set_state(&self, next: LifecycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}

async fn run_on_schedule(
    runner: Arc<Runner>,
    schedule: Schedule,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    tasks: TaskTracker,
) {
    let mut delay = schedule.initial_delay;
    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => break,
            () = clock.sleep(delay) => {},
        }
        // Ticks run on their own task so a slow run shows up as skipped ticks.
        let tick = runner.clone();
        tasks.spawn(async move { tick.run_once().await });
        delay = schedule.period;
    }
    debug!(runner = runner.name(), "timer stopped");
}

async fn sweep_health(
    health: Arc<HealthAggregator>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
) {
    let mut was_healthy = true;
    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => break,
            () = clock.sleep(interval) => {},
        }
        let report = health.check().await;
        if report.healthy && !was_healthy {
            warn!("health recovered");
        }
        was_healthy = report.healthy;
    }
}
