//! Health tracking for runners and transports.
//!
//! Each runner and transport exposes a [`HealthProvider`]. The
//! [`HealthAggregator`] ANDs them together and, once the combined result has
//! stayed unhealthy past a threshold, fires a shutdown callback exactly once.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::{error, warn};

use crate::time::Clock;

/// Time since the last successful run of some periodic activity.
///
/// A fresh tracker counts as a success at creation, so a runner is healthy
/// until its first `max_age` elapses without a successful run.
#[derive(Debug)]
pub struct RunnerHealth {
    clock: Arc<dyn Clock>,
    base: Instant,
    last_success_ns: AtomicU64,
    max_age: Duration,
}

impl RunnerHealth {
    /// Creates a tracker that becomes unhealthy after `max_age` without success.
    pub fn new(clock: Arc<dyn Clock>, max_age: Duration) -> Self {
        let base = clock.now();
        Self { clock, base, last_success_ns: AtomicU64::new(0), max_age }
    }

    /// Records a successful run at the current time.
    pub fn record_success(&self) {
        let since_base = self.clock.now().saturating_duration_since(self.base);
        let ns = u64::try_from(since_base.as_nanos()).unwrap_or(u64::MAX);
        self.last_success_ns.fetch_max(ns, Ordering::AcqRel);
    }

    /// Instant of the last successful run.
    pub fn last_successful_run(&self) -> Instant {
        self.base + Duration::from_nanos(self.last_success_ns.load(Ordering::Acquire))
    }

    /// Time elapsed since the last successful run.
    pub fn age(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.last_successful_run())
    }

    /// Maximum age before the tracker reports unhealthy.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// `now - last_successful_run < max_age`.
    pub fn is_healthy(&self) -> bool {
        self.age() < self.max_age
    }
}

/// Something whose health contributes to the process health.
#[async_trait]
pub trait HealthProvider: Send + Sync {
    /// Name used in logs and health reports.
    fn name(&self) -> &str;

    /// Current health.
    async fn is_healthy(&self) -> bool;
}

/// Invoked once when health stays bad past the threshold.
pub type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

/// Result of one aggregated health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// AND over all providers.
    pub healthy: bool,
    /// Names of providers that reported unhealthy.
    pub unhealthy: Vec<String>,
    /// How long the combined health has been false.
    pub unhealthy_for: Option<Duration>,
    /// Whether this check fired the shutdown callback.
    pub shutdown_triggered: bool,
}

/// Combines registered providers into one health signal.
pub struct HealthAggregator {
    providers: Vec<Arc<dyn HealthProvider>>,
    clock: Arc<dyn Clock>,
    unhealthy_threshold: Duration,
    unhealthy_since: Mutex<Option<Instant>>,
    on_sustained_failure: Option<ShutdownCallback>,
    shutdown_fired: AtomicBool,
}

impl fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("HealthAggregator")
            .field("providers", &names)
            .field("unhealthy_threshold", &self.unhealthy_threshold)
            .finish_non_exhaustive()
    }
}

impl HealthAggregator {
    /// Creates an aggregator with no providers.
    pub fn new(clock: Arc<dyn Clock>, unhealthy_threshold: Duration) -> Self {
        Self {
            providers: Vec::new(),
            clock,
            unhealthy_threshold,
            unhealthy_since: Mutex::new(None),
            on_sustained_failure: None,
            shutdown_fired: AtomicBool::new(false),
        }
    }

    /// Registers a provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn HealthProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Sets the callback fired once health has been false past the threshold.
    #[must_use]
    pub fn on_sustained_failure(mut self, callback: ShutdownCallback) -> Self {
        self.on_sustained_failure = Some(callback);
        self
    }

    /// Number of registered providers.
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// AND over all providers. True when none are registered.
    pub async fn is_healthy(&self) -> bool {
        self.unhealthy_providers().await.is_empty()
    }

    /// Runs one health sweep and fires the shutdown callback when due.
    pub async fn check(&self) -> HealthReport {
        let unhealthy = self.unhealthy_providers().await;
        let healthy = unhealthy.is_empty();
        let now = self.clock.now();

        let unhealthy_for = {
            let mut since = self.unhealthy_since.lock().unwrap_or_else(PoisonError::into_inner);
            if healthy {
                *since = None;
                None
            } else {
                let started = *since.get_or_insert(now);
                Some(now.saturating_duration_since(started))
            }
        };

        let mut shutdown_triggered = false;
        if let Some(duration) = unhealthy_for {
            warn!(
                unhealthy = ?unhealthy,
                unhealthy_secs = duration.as_secs(),
                "health check failed"
            );

            if duration >= self.unhealthy_threshold {
                if let Some(callback) = &self.on_sustained_failure {
                    if !self.shutdown_fired.swap(true, Ordering::AcqRel) {
                        error!(
                            threshold_secs = self.unhealthy_threshold.as_secs(),
                            "unhealthy past threshold, requesting shutdown"
                        );
                        callback();
                        shutdown_triggered = true;
                    }
                }
            }
        }

        HealthReport { healthy, unhealthy, unhealthy_for, shutdown_triggered }
    }

    async fn unhealthy_providers(&self) -> Vec<String> {
        let mut unhealthy = Vec::new();
        for provider in &self.providers {
            if !provider.is_healthy().await {
                unhealthy.push(provider.name().to_string());
            }
        }
        unhealthy
    }
}
