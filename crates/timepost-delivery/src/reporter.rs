//! Pushes locally resolved outcomes back to the remote service.
//!
//! Reports go out two ways. [`StatusReporter::report_now`] fires a background
//! task right after an event is resolved. [`StatusReporter::sweep`] runs on a
//! timer and retries every resolved record the remote service has not
//! acknowledged yet, which also covers reports lost to a restart. A record
//! is marked sent only after the remote service accepted its report.

use std::{sync::Arc, time::Duration};

use timepost_core::{DedupStore, EventId, Outcome};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    remote::{RemoteClient, StatusReport},
    stats::SharedStats,
};

/// Default number of reports in flight at once.
pub const DEFAULT_MAX_CONCURRENT_REPORTS: usize = 4;

/// Summary of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Pending records found.
    pub pending: usize,
    /// Reports accepted and marked sent.
    pub reported: usize,
    /// Reports that failed and stay pending.
    pub failed: usize,
}

/// Reports outcomes to the remote service.
#[derive(Debug)]
pub struct StatusReporter {
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn DedupStore>,
    stats: SharedStats,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl StatusReporter {
    /// Creates a reporter with at most `max_concurrent` background reports.
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn DedupStore>,
        stats: SharedStats,
        max_concurrent: usize,
    ) -> Self {
        Self {
            remote,
            store,
            stats,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: TaskTracker::new(),
        }
    }

    /// Reports in the background. Failures are logged and left for the sweep.
    ///
    /// After [`StatusReporter::shutdown`] this does nothing; the record stays
    /// pending and the next process picks it up.
    pub fn report_now(self: &Arc<Self>, id: EventId, outcome: Outcome) {
        if self.tasks.is_closed() {
            debug!(event_id = %id, "reporter stopped, leaving report for the next sweep");
            return;
        }

        let reporter = Arc::clone(self);
        self.tasks.spawn(async move {
            let Ok(_permit) = reporter.permits.clone().acquire_owned().await else {
                return;
            };
            if let Err(e) = reporter.report(id.clone(), &outcome).await {
                warn!(event_id = %id, error = %e, "status report failed, sweep will retry");
            }
        });
    }

    /// Reports one outcome and marks the record sent.
    pub async fn report(&self, id: EventId, outcome: &Outcome) -> Result<()> {
        let report = StatusReport::from_outcome(id.clone(), outcome);

        if let Err(e) = self.remote.report_status(&report).await {
            self.stats.write().await.reports_failed += 1;
            return Err(e);
        }
        self.stats.write().await.reports_sent += 1;

        if !self.store.mark_sent(id.clone()).await? {
            warn!(event_id = %id, "reported event has no resolved record to mark sent");
        }
        debug!(event_id = %id, status = %report.status, "status reported");
        Ok(())
    }

    /// Reports every resolved record not yet marked sent.
    ///
    /// Per-record failures are counted, not returned. Only a failure to read
    /// the pending set is an error.
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let pending = self.store.pending_status_reports().await?;
        let mut summary = SweepSummary { pending: pending.len(), ..SweepSummary::default() };

        for (id, outcome) in pending {
            match self.report(id.clone(), &outcome).await {
                Ok(()) => summary.reported += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(event_id = %id, error = %e, "sweep report failed");
                },
            }
        }

        if summary.pending > 0 {
            info!(
                pending = summary.pending,
                reported = summary.reported,
                failed = summary.failed,
                "status sweep finished"
            );
        }
        Ok(summary)
    }

    /// Number of background reports not yet finished.
    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Stops accepting background reports and waits for running ones.
    ///
    /// Returns false when reports were still running after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(outstanding = self.tasks.len(), "status reports still running at shutdown");
            return false;
        }
        true
    }
}
