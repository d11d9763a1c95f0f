//! Scripted handler that records every call.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use timepost_core::{Event, EventId, Handler, Outcome};
use tokio::sync::Semaphore;

/// What the handler does for one event id.
#[derive(Debug, Clone)]
pub enum Script {
    /// Return this outcome.
    Outcome(Outcome),
    /// Return an error with this message.
    Error(String),
    /// Panic with this message.
    Panic(String),
}

/// Handler double with scripted results, an optional gate that holds
/// invocations until released, and a call log.
///
/// Unscripted events succeed.
#[derive(Debug)]
pub struct RecordingHandler {
    scripts: Mutex<HashMap<EventId, Script>>,
    invocations: Mutex<Vec<EventId>>,
    lifecycle: Mutex<Vec<&'static str>>,
    gated: AtomicBool,
    gate: Semaphore,
    active: AtomicUsize,
    max_active: AtomicUsize,
    fail_sync: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingHandler {
    /// Creates a handler that succeeds for every event.
    pub fn new() -> Self {
        Self {
            scripts: Mutex::default(),
            invocations: Mutex::default(),
            lifecycle: Mutex::default(),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            fail_sync: AtomicBool::new(false),
        }
    }

    /// Scripts the result for `id`.
    pub fn script(&self, id: impl Into<EventId>, script: Script) {
        lock(&self.scripts).insert(id.into(), script);
    }

    /// Scripts an outcome for `id`.
    pub fn respond(&self, id: impl Into<EventId>, outcome: Outcome) {
        self.script(id, Script::Outcome(outcome));
    }

    /// Scripts an error for `id`.
    pub fn fail(&self, id: impl Into<EventId>, message: impl Into<String>) {
        self.script(id, Script::Error(message.into()));
    }

    /// Scripts a panic for `id`.
    pub fn panic_on(&self, id: impl Into<EventId>, message: impl Into<String>) {
        self.script(id, Script::Panic(message.into()));
    }

    /// Holds every following invocation until [`RecordingHandler::release`].
    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::Release);
    }

    /// Lets `n` held invocations through.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Makes `sync` and `slow_sync` fail.
    pub fn fail_syncs(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::Release);
    }

    /// Event ids passed to `handle`, in call order.
    pub fn invocations(&self) -> Vec<EventId> {
        lock(&self.invocations).clone()
    }

    /// How many times `handle` saw `id`.
    pub fn invocation_count(&self, id: &EventId) -> usize {
        lock(&self.invocations).iter().filter(|seen| *seen == id).count()
    }

    /// Lifecycle hooks called so far: `init`, `sync`, `slow_sync`, `shutdown`.
    pub fn lifecycle(&self) -> Vec<&'static str> {
        lock(&self.lifecycle).clone()
    }

    /// Highest number of concurrent `handle` calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::Acquire)
    }

    /// Polls until `handle` has been called `count` times.
    ///
    /// # Errors
    ///
    /// Returns error when `timeout` passes first.
    pub async fn wait_for_invocations(&self, count: usize, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();
        loop {
            let seen = lock(&self.invocations).len();
            if seen >= count {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("timeout waiting for {count} handler invocations, saw {seen}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn note(&self, hook: &'static str) {
        lock(&self.lifecycle).push(hook);
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn init(&self) -> Result<()> {
        self.note("init");
        Ok(())
    }

    #[allow(clippy::panic)]
    async fn handle(&self, event: &Event) -> Result<Outcome> {
        lock(&self.invocations).push(event.id.clone());
        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_active.fetch_max(active, Ordering::AcqRel);

        if self.gated.load(Ordering::Acquire) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        let script = lock(&self.scripts).get(&event.id).cloned();
        self.active.fetch_sub(1, Ordering::AcqRel);

        match script {
            None => Ok(Outcome::success()),
            Some(Script::Outcome(outcome)) => Ok(outcome),
            Some(Script::Error(message)) => bail!(message),
            Some(Script::Panic(message)) => panic!("{message}"),
        }
    }

    async fn sync(&self) -> Result<()> {
        self.note("sync");
        if self.fail_sync.load(Ordering::Acquire) {
            bail!("scripted sync failure");
        }
        Ok(())
    }

    async fn slow_sync(&self) -> Result<()> {
        self.note("slow_sync");
        if self.fail_sync.load(Ordering::Acquire) {
            bail!("scripted slow sync failure");
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.note("shutdown");
        Ok(())
    }
}
