// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Mutex;
use std::time::Duration;

use super::{secs_to_duration_saturating, BackOffContext, BackOffPolicy};
use crate::clock::{Clock, SleepInterrupted};
use crate::rnd::Rnd;
use crate::supplier::Supplier;
use crate::ERR_POISONED_LOCK;

/// The default first pause.
pub(crate) const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(100);

/// The default growth factor between pauses.
pub(crate) const DEFAULT_MULTIPLIER: f64 = 2.0;

/// The default ceiling on any single pause.
pub(crate) const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Pauses for an exponentially growing period between attempts, with an
/// optional uniform jitter.
///
/// The first pause is the initial interval; each subsequent pause multiplies
/// the previous one by the multiplier, capped at the maximum interval. The
/// per-execution interval lives in the [`BackOffContext`] produced by
/// [`start`][BackOffPolicy::start], so concurrent executions never share
/// schedules and a cached stateful retry resumes where it left off.
///
/// With [`random`][Self::random] enabled, each pause is stretched by a
/// random factor in `[1, multiplier)` and capped at the maximum interval.
/// The stored interval still advances by the deterministic multiplier, so
/// expected growth matches the non-jittered schedule.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mulligan::backoff::ExponentialBackOff;
///
/// let backoff = ExponentialBackOff::new()
///     .initial_interval(Duration::from_millis(50))
///     .multiplier(2.0)
///     .max_interval(Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialBackOff {
    initial: Supplier<Duration>,
    multiplier: Supplier<f64>,
    max: Supplier<Duration>,
    random: bool,
    clock: Clock,
    rnd: Rnd,
}

impl ExponentialBackOff {
    /// Creates a policy with the default schedule: 100 ms initial interval,
    /// multiplier 2.0, 30 s ceiling, no jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initial: Supplier::Fixed(DEFAULT_INITIAL_INTERVAL),
            multiplier: Supplier::Fixed(DEFAULT_MULTIPLIER),
            max: Supplier::Fixed(DEFAULT_MAX_INTERVAL),
            random: false,
            clock: Clock::new(),
            rnd: Rnd::default(),
        }
    }

    /// Sets the first pause. Values below one millisecond are clamped.
    #[must_use]
    pub fn initial_interval(mut self, initial: Duration) -> Self {
        if initial < super::fixed::MIN_PERIOD {
            tracing::warn!(?initial, "initial interval must be at least 1ms, clamping");
        }
        self.initial = Supplier::Fixed(initial.max(super::fixed::MIN_PERIOD));
        self
    }

    /// Sets a supplier for the first pause, re-read when an execution's
    /// schedule starts.
    #[must_use]
    pub fn initial_interval_supplier(mut self, supplier: impl Fn() -> Duration + Send + Sync + 'static) -> Self {
        self.initial = Supplier::dynamic(move || supplier().max(super::fixed::MIN_PERIOD));
        self
    }

    /// Sets the growth factor. Values below 1.0 are clamped.
    ///
    /// Hint: values much in excess of 1.0 make the schedule very long very
    /// fast.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        if multiplier < 1.0 {
            tracing::warn!(multiplier, "multiplier must be at least 1.0, clamping");
        }
        self.multiplier = Supplier::Fixed(multiplier.max(1.0));
        self
    }

    /// Sets a supplier for the growth factor, re-read on every pause.
    #[must_use]
    pub fn multiplier_supplier(mut self, supplier: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.multiplier = Supplier::dynamic(move || supplier().max(1.0));
        self
    }

    /// Sets the ceiling on any single pause. Values below one millisecond
    /// are clamped.
    #[must_use]
    pub fn max_interval(mut self, max: Duration) -> Self {
        self.max = Supplier::Fixed(max.max(super::fixed::MIN_PERIOD));
        self
    }

    /// Sets a supplier for the ceiling, re-read on every pause.
    #[must_use]
    pub fn max_interval_supplier(mut self, supplier: impl Fn() -> Duration + Send + Sync + 'static) -> Self {
        self.max = Supplier::dynamic(move || supplier().max(super::fixed::MIN_PERIOD));
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn random(mut self, enabled: bool) -> Self {
        self.random = enabled;
        self
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

    fn apply_jitter(&self, sleep: Duration, multiplier: f64, max: Duration) -> Duration {
        let stretched =
            secs_to_duration_saturating(sleep.as_secs_f64() * (1.0 + self.rnd.next_f64() * (multiplier - 1.0)));
        stretched.min(max)
    }
}

impl Default for ExponentialBackOff {
    fn default() -> Self {
        Self::new()
    }
}

impl BackOffPolicy for ExponentialBackOff {
    fn start(&self) -> Option<BackOffContext> {
        Some(BackOffContext::new(ExponentialState {
            interval: Mutex::new(None),
            initial: self.initial.clone(),
            multiplier: self.multiplier.clone(),
            max: self.max.clone(),
        }))
    }

    fn back_off(&self, context: Option<&BackOffContext>) -> Result<(), SleepInterrupted> {
        let (mut sleep, multiplier, max) = match context.and_then(|c| c.downcast_ref::<ExponentialState>()) {
            Some(state) => state.sleep_and_increment(),
            // Without a started context there is no schedule to advance;
            // pause for the initial interval.
            None => {
                let max = self.max.get();
                (self.initial.get().min(max), self.multiplier.get(), max)
            }
        };

        if self.random {
            sleep = self.apply_jitter(sleep, multiplier, max);
        }

        tracing::trace!(?sleep, "backing off");
        self.clock.sleep(sleep)
    }
}

/// Per-execution interval state.
///
/// The initial interval is latched when the schedule first runs; the
/// multiplier and ceiling are re-read on every step so supplier changes
/// apply to in-flight executions without rewinding them.
#[derive(Debug)]
struct ExponentialState {
    interval: Mutex<Option<Duration>>,
    initial: Supplier<Duration>,
    multiplier: Supplier<f64>,
    max: Supplier<Duration>,
}

impl ExponentialState {
    // Serialized so concurrent executions sharing a context observe monotone
    // interval progression.
    fn sleep_and_increment(&self) -> (Duration, f64, Duration) {
        let mut interval = self.interval.lock().expect(ERR_POISONED_LOCK);
        let current = *interval.get_or_insert_with(|| self.initial.get());
        let multiplier = self.multiplier.get();
        let max = self.max.get();

        let sleep = if current > max {
            max
        } else {
            *interval = Some(secs_to_duration_saturating(current.as_secs_f64() * multiplier));
            current
        };

        (sleep, multiplier, max)
    }
}
