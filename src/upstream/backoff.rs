//! Retry pacing for store-error recovery.
//!
//! Tracks consecutive failures and hands out a randomized wait before the
//! next attempt: the delay is drawn uniformly from `[base, ceiling]`, where
//! the ceiling doubles with every failure until it hits the cap. The jitter
//! keeps several router instances sharing one store from retrying against
//! it in lockstep. One success clears the failure streak.

use std::time::Duration;

use rand::Rng;

/// Full-jitter exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Consecutive failures since the last success.
    failures: u32,
    /// Lower bound of every delay (also the healthy-path interval).
    base: Duration,
    /// Upper bound the ceiling can grow to.
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            failures: 0,
            base,
            cap: cap.max(base),
        }
    }

    /// Record a failure and return how long to wait before retrying.
    ///
    /// The wait is sampled uniformly between `base` and the current
    /// ceiling, then the failure streak grows.
    pub fn record_failure(&mut self) -> Duration {
        let floor = self.base.as_millis() as u64;
        let ceiling = self.ceiling().as_millis() as u64;
        self.failures = self.failures.saturating_add(1);

        if ceiling <= floor {
            return self.base;
        }
        let millis = rand::thread_rng().gen_range(floor..=ceiling);
        Duration::from_millis(millis)
    }

    /// Record a success, clearing the failure streak.
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the next delay would be stretched beyond the base interval.
    pub fn is_backing_off(&self) -> bool {
        self.failures > 0
    }

    /// Current upper bound for the next delay: `min(base << failures, cap)`.
    pub fn ceiling(&self) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let grown = base_ms.saturating_shl(self.failures.min(63));
        Duration::from_millis(grown.min(self.cap.as_millis() as u64))
    }
}

trait SaturatingShl {
    fn saturating_shl(self, shift: u32) -> Self;
}

impl SaturatingShl for u64 {
    fn saturating_shl(self, shift: u32) -> u64 {
        if self == 0 {
            0
        } else if shift >= u64::BITS || self > (u64::MAX >> shift) {
            u64::MAX
        } else {
            self << shift
        }
    }
}
