//! In-process stand-in for the remote time-event service.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use anyhow::bail;
use async_trait::async_trait;
use timepost_core::{Event, EventId};
use timepost_delivery::{DeliveryError, RemoteClient, RemoteStatus, StatusReport};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remote client double.
///
/// `fetch` serves queued batches or errors in order, then empty batches.
/// Reports are recorded; the next `n` of them can be made to fail.
#[derive(Debug, Default)]
pub struct MockRemoteClient {
    fetches: Mutex<VecDeque<Result<Vec<Event>, DeliveryError>>>,
    reports: Mutex<Vec<StatusReport>>,
    fetch_calls: AtomicUsize,
    fetch_limits: Mutex<Vec<usize>>,
    failing_reports: AtomicUsize,
    report_error: Mutex<Option<DeliveryError>>,
}

impl MockRemoteClient {
    /// Creates a client with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a batch for a later `fetch`.
    pub fn push_batch(&self, events: Vec<Event>) {
        lock(&self.fetches).push_back(Ok(events));
    }

    /// Queues a failed `fetch`.
    pub fn push_fetch_error(&self, error: DeliveryError) {
        lock(&self.fetches).push_back(Err(error));
    }

    /// Queues `count` consecutive failed fetches.
    pub fn fail_fetches(&self, count: usize, error: &DeliveryError) {
        let mut fetches = lock(&self.fetches);
        for _ in 0..count {
            fetches.push_back(Err(error.clone()));
        }
    }

    /// Makes the next `count` status reports fail with a 503.
    pub fn fail_next_reports(&self, count: usize) {
        self.failing_reports.store(count, Ordering::Release);
    }

    /// Makes the next `count` status reports fail with `error`.
    pub fn fail_next_reports_with(&self, count: usize, error: DeliveryError) {
        *lock(&self.report_error) = Some(error);
        self.fail_next_reports(count);
    }

    /// Accepted reports, in arrival order.
    pub fn reports(&self) -> Vec<StatusReport> {
        lock(&self.reports).clone()
    }

    /// Accepted reports for `id`.
    pub fn reports_for(&self, id: &EventId) -> Vec<StatusReport> {
        lock(&self.reports).iter().filter(|report| &report.id == id).cloned().collect()
    }

    /// Last accepted status for `id`.
    pub fn last_status(&self, id: &EventId) -> Option<RemoteStatus> {
        self.reports_for(id).last().map(|report| report.status)
    }

    /// Number of `fetch` calls so far.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::Acquire)
    }

    /// Limits passed to `fetch`, in call order.
    pub fn fetch_limits(&self) -> Vec<usize> {
        lock(&self.fetch_limits).clone()
    }

    /// Polls until `count` reports were accepted.
    ///
    /// # Errors
    ///
    /// Returns error when `timeout` passes first.
    pub async fn wait_for_reports(&self, count: usize, timeout: Duration) -> anyhow::Result<()> {
        let start = std::time::Instant::now();
        loop {
            let seen = lock(&self.reports).len();
            if seen >= count {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("timeout waiting for {count} status reports, saw {seen}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Polls until `fetch` was called `count` times.
    ///
    /// # Errors
    ///
    /// Returns error when `timeout` passes first.
    pub async fn wait_for_fetches(&self, count: usize, timeout: Duration) -> anyhow::Result<()> {
        let start = std::time::Instant::now();
        while self.fetch_calls() < count {
            if start.elapsed() > timeout {
                bail!("timeout waiting for {count} fetches, saw {}", self.fetch_calls());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for MockRemoteClient {
    async fn fetch(&self, limit: usize) -> timepost_delivery::Result<Vec<Event>> {
        self.fetch_calls.fetch_add(1, Ordering::AcqRel);
        lock(&self.fetch_limits).push(limit);
        match lock(&self.fetches).pop_front() {
            Some(Ok(mut events)) => {
                events.truncate(limit);
                Ok(events)
            },
            Some(Err(error)) => Err(error),
            None => Ok(Vec::new()),
        }
    }

    async fn report_status(&self, report: &StatusReport) -> timepost_delivery::Result<()> {
        let failing = self
            .failing_reports
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let error = lock(&self.report_error)
                .clone()
                .unwrap_or_else(|| DeliveryError::server_error(503, "scripted report failure"));
            return Err(error);
        }
        lock(&self.reports).push(report.clone());
        Ok(())
    }
}
