//! Clock abstraction for timers, backoff and health ages.
//!
//! Runners, the fetch loop and the health aggregator all measure time through
//! [`Clock`], so tests can drive hours of backoff and staleness with a
//! [`TestClock`] instead of waiting.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of time and sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring durations.
    fn now(&self) -> Instant;

    /// Wall-clock time for persisted timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall-clock time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Production clock backed by the system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for tests.
///
/// `sleep` advances virtual time by the requested amount and yields once, so
/// loops that sleep between iterations make progress without real waiting.
/// Every requested sleep is recorded and can be inspected with
/// [`TestClock::sleeps`].
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    system_base: SystemTime,
    base_instant: Instant,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific wall-clock time.
    pub fn with_start_time(start: SystemTime) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            system_base: start,
            base_instant: Instant::now(),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }

    /// Durations passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sleeps at least as long as `min`, in call order.
    pub fn sleeps_at_least(&self, min: Duration) -> Vec<Duration> {
        self.sleeps().into_iter().filter(|d| *d >= min).collect()
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.system_base + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.sleeps.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

/// Clock anchored at the Unix epoch, for tests that compare timestamps.
pub fn epoch_clock() -> TestClock {
    TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let clock = epoch_clock();
        let start = clock.now();
        let wall = clock.now_system();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(90));
        assert_eq!(clock.now_system(), wall + Duration::from_secs(90));
    }

    #[test]
    fn utc_timestamp_follows_virtual_time() {
        let clock = epoch_clock();
        let before = clock.now_utc();
        clock.advance(Duration::from_secs(3600));
        assert_eq!((clock.now_utc() - before).num_seconds(), 3600);
    }

    #[tokio::test]
    async fn sleep_advances_and_is_recorded() {
        let clock = TestClock::new();

        clock.sleep(Duration::from_secs(10)).await;
        clock.sleep(Duration::from_millis(500)).await;

        assert_eq!(clock.elapsed(), Duration::from_millis(10_500));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10), Duration::from_millis(500)]);
        assert_eq!(clock.sleeps_at_least(Duration::from_secs(1)), vec![Duration::from_secs(10)]);
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();
        other.advance(Duration::from_secs(5));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }
}
