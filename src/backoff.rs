//! Bounded exponential backoff shared by readiness probing and restarts.
use std::time::Duration;

/// Doubling delay schedule capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// Creates a schedule starting at `initial`. `max` is raised to `initial` if smaller.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// First delay of the schedule.
    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Upper bound for any single delay.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Returns the current delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = current.saturating_mul(2).min(self.max);
        current
    }

    /// Restarts the schedule from the initial delay.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    /// Delay before the `attempt`-th retry (1-based) without mutating the schedule.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}
