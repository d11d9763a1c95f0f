//! Delivery counters shared by the transports.

use std::sync::Arc;

use serde::Serialize;
use timepost_core::Outcome;
use tokio::sync::RwLock;

/// Shared handle to the counters.
pub type SharedStats = Arc<RwLock<DeliveryStats>>;

/// Processed-event counters, served at `/metric`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Events fetched or received.
    pub received: u64,
    /// Events handed to the handler.
    pub processed: u64,
    /// Handler successes.
    pub succeeded: u64,
    /// Handler retriable failures.
    pub transient_failures: u64,
    /// Handler permanent failures, including converted handler errors.
    pub permanent_failures: u64,
    /// Handler errors and panics.
    pub handler_errors: u64,
    /// Events answered from the dedup store.
    pub replayed: u64,
    /// Webhook requests rejected before reaching the handler.
    pub rejected: u64,
    /// Status reports acknowledged by the remote service.
    pub reports_sent: u64,
    /// Status reports that failed.
    pub reports_failed: u64,
    /// Handler invocations currently running.
    pub in_flight: u64,
}

impl DeliveryStats {
    /// Creates a zeroed shared counter set.
    pub fn shared() -> SharedStats {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Counts one handler result.
    pub fn record_outcome(&mut self, outcome: &Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Success { .. } => self.succeeded += 1,
            Outcome::TransientFailure { .. } => self.transient_failures += 1,
            Outcome::PermanentFailure { .. } => self.permanent_failures += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_are_counted_by_kind() {
        let mut stats = DeliveryStats::default();
        stats.record_outcome(&Outcome::success());
        stats.record_outcome(&Outcome::transient("later"));
        stats.record_outcome(&Outcome::permanent("never"));
        stats.record_outcome(&Outcome::success());

        assert_eq!(stats.processed, 4);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.transient_failures, 1);
        assert_eq!(stats.permanent_failures, 1);
    }
}
