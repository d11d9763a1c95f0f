//! Single-slot worker that runs the handler for pulled events.
//!
//! Jobs are processed one at a time in submission order. The handler is
//! never invoked concurrently from here.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use timepost_core::{invoke_handler, DedupStore, Event, Handler, InFlightGuard, LocalStatus};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{reporter::StatusReporter, stats::SharedStats};

/// One event waiting for the handler. The in-flight claim is released when
/// the job is dropped, after processing or on shutdown.
#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) event: Event,
    pub(crate) claim: InFlightGuard,
}

/// Processes jobs for the fetch loop.
#[derive(Debug)]
pub(crate) struct DeliveryWorker {
    store: Arc<dyn DedupStore>,
    handler: Arc<dyn Handler>,
    reporter: Arc<StatusReporter>,
    stats: SharedStats,
}

/// Handle to a running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    sender: mpsc::UnboundedSender<Job>,
    outstanding: Arc<AtomicUsize>,
    join: JoinHandle<()>,
}

impl DeliveryWorker {
    pub(crate) fn new(
        store: Arc<dyn DedupStore>,
        handler: Arc<dyn Handler>,
        reporter: Arc<StatusReporter>,
        stats: SharedStats,
    ) -> Self {
        Self { store, handler, reporter, stats }
    }

    pub(crate) fn spawn(self) -> WorkerHandle {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let counter = outstanding.clone();

        let join = tokio::spawn(async move {
            debug!("delivery worker starting");
            while let Some(job) = receiver.recv().await {
                self.process(job).await;
                counter.fetch_sub(1, Ordering::AcqRel);
            }
            debug!("delivery worker stopped");
        });

        WorkerHandle { sender, outstanding, join }
    }

    async fn process(&self, job: Job) {
        let Job { event, claim: _claim } = job;
        let id = event.id.clone();

        // The record may have been resolved since dispatch.
        match self.store.lookup(id.clone()).await {
            Ok(Some(record)) if record.status == LocalStatus::InProgress => {},
            Ok(record) => {
                warn!(
                    event_id = %id,
                    status = ?record.map(|r| r.status),
                    "event no longer in progress, not invoking handler"
                );
                return;
            },
            Err(e) => {
                error!(event_id = %id, error = %e, "failed to re-check event, leaving it for redelivery");
                return;
            },
        }

        self.stats.write().await.in_flight += 1;
        let result = invoke_handler(self.handler.as_ref(), &event).await;
        let handler_failed = result.is_err();
        let outcome = result.unwrap_or_else(|failure| {
            error!(event_id = %id, error = %failure, "handler failed, recording permanent failure");
            failure.into_outcome()
        });
        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
            if handler_failed {
                stats.handler_errors += 1;
            }
            stats.record_outcome(&outcome);
        }

        match self.store.record_outcome(id.clone(), outcome.clone()).await {
            Ok(true) => {
                info!(event_id = %id, status = %outcome.local_status(), "event resolved");
                self.reporter.report_now(id, outcome);
            },
            Ok(false) => warn!(event_id = %id, "event was resolved elsewhere, outcome discarded"),
            Err(e) => error!(
                event_id = %id,
                error = %e,
                "failed to persist outcome, event stays in progress until redelivered"
            ),
        }
    }
}

impl WorkerHandle {
    /// Queues a job. Gives it back if the worker has stopped.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.sender.send(job).map_err(|e| {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            e.0
        })
    }

    /// Jobs queued or running.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Closes the queue and waits for queued jobs to drain.
    ///
    /// Returns false on timeout; the worker task is aborted in that case.
    pub(crate) async fn shutdown(self, timeout: Duration) -> bool {
        let Self { sender, outstanding, mut join } = self;
        drop(sender);

        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "delivery worker terminated abnormally");
                true
            },
            Err(_) => {
                warn!(
                    outstanding = outstanding.load(Ordering::Acquire),
                    timeout_seconds = timeout.as_secs(),
                    "delivery worker did not drain in time"
                );
                join.abort();
                false
            },
        }
    }
}
