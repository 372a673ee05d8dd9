//! Token reservoir with periodic refresh.

use tokio::time::{Duration, Instant};

use crate::config::ReservoirConfig;

/// A burst budget that is reset to a fixed amount on a fixed interval.
///
/// Refreshes are anchored at creation time, so the schedule does not drift
/// with the timing of the callers that observe it.
#[derive(Debug, Clone)]
pub struct Reservoir {
    /// Tokens left until the next refresh
    tokens: u64,
    /// Token count restored on refresh
    refresh_amount: u64,
    /// Time between refreshes
    interval: Duration,
    /// When the current refresh period started
    period_start: Instant,
}

impl Reservoir {
    /// Create a new reservoir starting at `now`.
    pub fn new(config: &ReservoirConfig, now: Instant) -> Self {
        Self {
            tokens: config.size,
            refresh_amount: config.refresh_amount,
            interval: config.refresh_interval(),
            period_start: now,
        }
    }

    /// Take one token if any are left.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.maybe_refresh(now);

        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    /// Tokens available at `now`.
    pub fn remaining(&mut self, now: Instant) -> u64 {
        self.maybe_refresh(now);
        self.tokens
    }

    /// Time until the next refresh.
    pub fn until_refresh(&self, now: Instant) -> Duration {
        if self.interval.is_zero() {
            // never refreshes
            return Duration::MAX;
        }
        let elapsed = now.saturating_duration_since(self.period_start);

        if elapsed >= self.interval {
            Duration::ZERO
        } else {
            self.interval - elapsed
        }
    }

    /// Restore the budget if one or more periods have passed.
    fn maybe_refresh(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.period_start);
        if self.interval.is_zero() || elapsed < self.interval {
            return;
        }

        let periods = elapsed.as_nanos() / self.interval.as_nanos();
        let skipped = self.interval.as_nanos() * periods;
        self.period_start += Duration::from_nanos(skipped as u64);
        self.tokens = self.refresh_amount;
    }
}
