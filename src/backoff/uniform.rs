// Copyright (c) Microsoft Corporation.

use std::time::Duration;

use super::{secs_to_duration_saturating, BackOffContext, BackOffPolicy};
use crate::clock::{Clock, SleepInterrupted};
use crate::rnd::Rnd;
use crate::supplier::Supplier;

pub(crate) const DEFAULT_MIN_PERIOD: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_MAX_PERIOD: Duration = Duration::from_millis(1500);

/// Pauses for a random period uniformly distributed between a minimum and a
/// maximum.
///
/// Stateless: each pause samples independently. When the maximum does not
/// exceed the minimum, the pause is exactly the minimum.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mulligan::backoff::UniformRandomBackOff;
///
/// let backoff = UniformRandomBackOff::new(Duration::from_millis(100), Duration::from_millis(400));
/// assert_eq!(backoff.min_period(), Duration::from_millis(100));
/// assert_eq!(backoff.max_period(), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct UniformRandomBackOff {
    min_period: Supplier<Duration>,
    max_period: Supplier<Duration>,
    clock: Clock,
    rnd: Rnd,
}

impl UniformRandomBackOff {
    /// Creates a policy pausing between `min` and `max` per attempt.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min_period: Supplier::Fixed(min.max(super::fixed::MIN_PERIOD)),
            max_period: Supplier::Fixed(max.max(super::fixed::MIN_PERIOD)),
            clock: Clock::new(),
            rnd: Rnd::default(),
        }
    }

    /// Creates a policy that re-evaluates its bounds on every pause.
    #[must_use]
    pub fn with_period_suppliers(
        min: impl Fn() -> Duration + Send + Sync + 'static,
        max: impl Fn() -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            min_period: Supplier::dynamic(move || min().max(super::fixed::MIN_PERIOD)),
            max_period: Supplier::dynamic(move || max().max(super::fixed::MIN_PERIOD)),
            clock: Clock::new(),
            rnd: Rnd::default(),
        }
    }

    /// Replaces the clock used to suspend the caller.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_rnd(mut self, rnd: Rnd) -> Self {
        self.rnd = rnd;
        self
    }

    /// The current minimum pause.
    #[must_use]
    pub fn min_period(&self) -> Duration {
        self.min_period.get()
    }

    /// The current maximum pause.
    #[must_use]
    pub fn max_period(&self) -> Duration {
        self.max_period.get()
    }

    fn next_pause(&self) -> Duration {
        let min = self.min_period.get();
        let max = self.max_period.get();
        if max <= min {
            return min;
        }

        let delta = secs_to_duration_saturating((max - min).as_secs_f64() * self.rnd.next_f64());
        min + delta
    }
}

impl Default for UniformRandomBackOff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_PERIOD, DEFAULT_MAX_PERIOD)
    }
}

impl BackOffPolicy for UniformRandomBackOff {
    fn back_off(&self, _context: Option<&BackOffContext>) -> Result<(), SleepInterrupted> {
        self.clock.sleep(self.next_pause())
    }
}
