//! Exponential backoff for remote calls.
//!
//! The fetch loop retries transient failures with a [`RetryPolicy`]. With
//! jitter disabled the delays never decrease, which keeps the total time
//! spent backing off predictable.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// How failed calls are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Random spread applied to each delay, from 0.0 to 1.0.
    pub jitter_factor: f64,

    /// How delays grow between attempts.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fetch()
    }
}

impl RetryPolicy {
    /// Policy used by the long-poll fetch: 10 attempts, 10s doubling up to
    /// 600s, no jitter.
    pub fn fetch() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Decides whether attempt number `attempt` (1-based) that failed with
    /// `error` should be followed by another.
    pub fn decide(&self, attempt: u32, error: &DeliveryError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        // Retry-After only ever lengthens the backoff.
        let backoff = self.delay_for_attempt(attempt);
        let delay = match error.retry_after_seconds() {
            Some(seconds) => Duration::from_secs(seconds).max(backoff).min(self.max_delay),
            None => backoff,
        };
        RetryDecision::Retry { delay }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        let raw = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(step.saturating_add(1)),
            BackoffStrategy::Exponential => {
                self.base_delay.saturating_mul(2_u32.saturating_pow(step.min(20)))
            },
        };

        let capped = raw.min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

/// Strategy for growing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// Delay grows by `base_delay` each attempt.
    Linear,
    /// Delay doubles each attempt.
    Exponential,
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again.
    Retry {
        /// How long to wait
        delay: Duration,
    },
    /// Stop retrying.
    GiveUp {
        /// Why
        reason: String,
    },
}

/// Spreads a delay by up to ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let spread = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_policy_schedule() {
        let policy = RetryPolicy::fetch();
        let delays: Vec<u64> = (1..policy.max_attempts)
            .map(|attempt| policy.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 320, 600, 600, 600]);
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let policy = RetryPolicy::fetch();
        let err = DeliveryError::network("reset");
        assert!(matches!(policy.decide(9, &err), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(10, &err), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn non_retryable_errors_give_up_immediately() {
        let policy = RetryPolicy::fetch();
        let decision = policy.decide(1, &DeliveryError::client_error(403, "forbidden"));
        assert!(
            matches!(decision, RetryDecision::GiveUp { reason } if reason.contains("non-retryable"))
        );
    }

    #[test]
    fn rate_limit_wait_is_capped() {
        let policy = RetryPolicy::fetch();
        assert_eq!(
            policy.decide(1, &DeliveryError::rate_limited(30)),
            RetryDecision::Retry { delay: Duration::from_secs(30) }
        );
        assert_eq!(
            policy.decide(1, &DeliveryError::rate_limited(3600)),
            RetryDecision::Retry { delay: Duration::from_secs(600) }
        );
    }

    #[test]
    fn short_retry_after_does_not_shorten_backoff() {
        let policy = RetryPolicy::fetch();
        let network = DeliveryError::network("reset");
        let mut delays: Vec<u64> = (1..=3)
            .map(|attempt| match policy.decide(attempt, &network) {
                RetryDecision::Retry { delay } => delay.as_secs(),
                RetryDecision::GiveUp { reason } => panic!("gave up: {reason}"),
            })
            .collect();
        match policy.decide(4, &DeliveryError::rate_limited(1)) {
            RetryDecision::Retry { delay } => delays.push(delay.as_secs()),
            RetryDecision::GiveUp { reason } => panic!("gave up: {reason}"),
        }

        assert_eq!(delays, vec![10, 20, 40, 80]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy { jitter_factor: 0.25, ..RetryPolicy::fetch() };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_secs(15) && delay <= Duration::from_secs(25));
        }
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let linear = RetryPolicy { backoff_strategy: BackoffStrategy::Linear, ..RetryPolicy::fetch() };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_secs(30));

        let fixed = RetryPolicy { backoff_strategy: BackoffStrategy::Fixed, ..RetryPolicy::fetch() };
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_secs(10));
    }
}
