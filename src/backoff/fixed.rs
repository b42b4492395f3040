// Copyright (c) Microsoft Corporation.

use std::time::Duration;

use super::{BackOffContext, BackOffPolicy};
use crate::clock::{Clock, SleepInterrupted};
use crate::supplier::Supplier;

/// The default fixed pause between attempts.
pub(crate) const DEFAULT_PERIOD: Duration = Duration::from_millis(1000);

/// The smallest pause a sleeping backoff policy accepts.
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Pauses for a fixed period between attempts.
///
/// Stateless: every pause within and across executions is the same period.
/// The period cannot go below one millisecond; smaller values are clamped.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mulligan::backoff::FixedBackOff;
///
/// let backoff = FixedBackOff::new(Duration::from_millis(250));
/// assert_eq!(backoff.period(), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone)]
pub struct FixedBackOff {
    period: Supplier<Duration>,
    clock: Clock,
}

impl FixedBackOff {
    /// Creates a policy pausing for `period` between attempts.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        if period < MIN_PERIOD {
            tracing::warn!(?period, "backoff period must be at least 1ms, clamping");
        }
        Self {
            period: Supplier::Fixed(period.max(MIN_PERIOD)),
            clock: Clock::new(),
        }
    }

    /// Creates a policy that re-evaluates its period on every pause.
    #[must_use]
    pub fn with_period_supplier(supplier: impl Fn() -> Duration + Send + Sync + 'static) -> Self {
        Self {
            period: Supplier::dynamic(move || supplier().max(MIN_PERIOD)),
            clock: Clock::new(),
        }
    }

    /// Replaces the clock used to suspend the caller.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The current pause period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period.get()
    }
}

impl Default for FixedBackOff {
    fn default() -> Self {
        Self::new(DEFAULT_PERIOD)
    }
}

impl BackOffPolicy for FixedBackOff {
    fn back_off(&self, _context: Option<&BackOffContext>) -> Result<(), SleepInterrupted> {
        self.clock.sleep(self.period.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClockControl;

    #[test]
    fn sleeps_exactly_the_period() {
        let control = ClockControl::new();
        let backoff = FixedBackOff::new(Duration::from_millis(10)).with_clock(control.to_clock());

        backoff.back_off(None).unwrap();
        backoff.back_off(None).unwrap();

        assert_eq!(
            control.sleeps(),
            vec![Duration::from_millis(10), Duration::from_millis(10)]
        );
    }

    #[test]
    fn zero_period_is_clamped_to_one_milli() {
        let backoff = FixedBackOff::new(Duration::ZERO);
        assert_eq!(backoff.period(), Duration::from_millis(1));
    }

    #[test]
    fn supplier_changes_apply_between_pauses() {
        let control = ClockControl::new();
        let period = std::sync::Arc::new(std::sync::Mutex::new(Duration::from_millis(5)));
        let period_clone = std::sync::Arc::clone(&period);

        let backoff = FixedBackOff::with_period_supplier(move || *period_clone.lock().unwrap())
            .with_clock(control.to_clock());

        backoff.back_off(None).unwrap();
        *period.lock().unwrap() = Duration::from_millis(8);
        backoff.back_off(None).unwrap();

        assert_eq!(control.sleeps(), vec![Duration::from_millis(5), Duration::from_millis(8)]);
    }

    #[test]
    fn stateless_start_returns_none() {
        assert!(FixedBackOff::default().start().is_none());
    }
}
