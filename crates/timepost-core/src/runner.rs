//! Singleton-run wrapper for periodic actions.
//!
//! A [`Runner`] never runs its action twice at once. A tick that arrives
//! while the previous invocation is still going is skipped, not queued.
//! Errors and panics from the action are logged and contained, and every
//! successful invocation refreshes the runner's [`RunnerHealth`].

use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info};

use crate::{
    handler::panic_message,
    health::{HealthProvider, RunnerHealth},
};

/// Boxed future returned by a runner action.
pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// The work a runner performs on each tick.
#[derive(Clone)]
pub enum RunnerAction {
    /// Does nothing and always succeeds.
    NoOp,
    /// Runs the wrapped closure.
    Task(Arc<dyn Fn() -> ActionFuture + Send + Sync>),
}

impl RunnerAction {
    /// Wraps an async closure.
    pub fn task<F, Fut>(action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Task(Arc::new(move || Box::pin(action())))
    }
}

impl fmt::Debug for RunnerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => f.write_str("NoOp"),
            Self::Task(_) => f.write_str("Task(..)"),
        }
    }
}

/// What happened on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The action completed successfully.
    Succeeded,
    /// The action returned an error or panicked.
    Failed,
    /// A previous invocation was still running.
    Skipped,
}

/// Periodic action with overlap protection and a health signal.
pub struct Runner {
    name: String,
    action: RunnerAction,
    running: AtomicBool,
    health: Arc<RunnerHealth>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("name", &self.name)
            .field("action", &self.action)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Releases the running flag however the invocation ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Runner {
    /// Creates a runner.
    pub fn new(name: impl Into<String>, action: RunnerAction, health: Arc<RunnerHealth>) -> Self {
        Self { name: name.into(), action, running: AtomicBool::new(false), health }
    }

    /// Creates a runner that does nothing.
    pub fn noop(name: impl Into<String>, health: Arc<RunnerHealth>) -> Self {
        Self::new(name, RunnerAction::NoOp, health)
    }

    /// Runner name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Health tracker updated by this runner.
    pub fn health(&self) -> &Arc<RunnerHealth> {
        &self.health
    }

    /// True while an invocation is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs the action unless a previous invocation is still in progress.
    pub async fn run_once(&self) -> RunOutcome {
        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            info!(runner = %self.name, "previous run still in progress, skipping tick");
            return RunOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);

        let action = match &self.action {
            RunnerAction::NoOp => {
                self.health.record_success();
                return RunOutcome::Succeeded;
            },
            RunnerAction::Task(action) => action.clone(),
        };

        debug!(runner = %self.name, "running");
        match AssertUnwindSafe(action()).catch_unwind().await {
            Ok(Ok(())) => {
                self.health.record_success();
                RunOutcome::Succeeded
            },
            Ok(Err(err)) => {
                error!(runner = %self.name, error = %format!("{err:#}"), "run failed");
                RunOutcome::Failed
            },
            Err(panic) => {
                error!(
                    runner = %self.name,
                    panic = %panic_message(panic.as_ref()),
                    "run panicked"
                );
                RunOutcome::Failed
            },
        }
    }
}

#[async_trait]
impl HealthProvider for Runner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}
