// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::{Clock, ERR_POISONED_LOCK};

/// Controls the flow of time in tests.
///
/// A controlled [`Clock`] only moves when the test advances it, either
/// explicitly via [`ClockControl::advance`] or implicitly when something
/// sleeps on it. Sleeps never block; they are recorded and can be inspected
/// with [`ClockControl::sleeps`]. This makes backoff schedules, timeout
/// windows, and circuit-breaker transitions fully deterministic under test.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mulligan::ClockControl;
///
/// let control = ClockControl::new();
/// let clock = control.to_clock();
///
/// let start = clock.instant();
/// control.advance(Duration::from_secs(30));
/// assert_eq!(clock.instant() - start, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ClockControl {
    // Time control must be consistent across every thread holding a clone of
    // the clock, hence the shared mutex-protected state.
    state: Arc<ControlState>,
}

#[derive(Debug)]
pub(crate) struct ControlState {
    pub(crate) base: Instant,
    pub(crate) inner: Mutex<ControlInner>,
}

#[derive(Debug, Default)]
pub(crate) struct ControlInner {
    pub(crate) offset: Duration,
    pub(crate) sleeps: Vec<Duration>,
    pub(crate) interrupt_sleeps: bool,
}

impl ClockControl {
    /// Creates a new `ClockControl` anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(ControlState {
                base: Instant::now(),
                inner: Mutex::new(ControlInner::default()),
            }),
        }
    }

    /// Creates a [`Clock`] sharing this control's flow of time.
    ///
    /// All clocks produced from the same control observe the same time.
    #[must_use]
    pub fn to_clock(&self) -> Clock {
        Clock::controlled(Arc::clone(&self.state))
    }

    /// Advances the virtual time by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.state.inner.lock().expect(ERR_POISONED_LOCK).offset += duration;
    }

    /// Returns every sleep requested so far, in order, including interrupted
    /// ones.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.inner.lock().expect(ERR_POISONED_LOCK).sleeps.clone()
    }

    /// Returns the sum of all completed sleep durations.
    #[must_use]
    pub fn total_slept(&self) -> Duration {
        self.state.inner.lock().expect(ERR_POISONED_LOCK).sleeps.iter().sum()
    }

    /// When enabled, every subsequent sleep on clocks from this control fails
    /// with [`SleepInterrupted`][crate::SleepInterrupted] instead of
    /// advancing time.
    pub fn interrupt_sleeps(&self, enabled: bool) {
        self.state.inner.lock().expect(ERR_POISONED_LOCK).interrupt_sleeps = enabled;
    }
}

impl Default for ClockControl {
    fn default() -> Self {
        Self::new()
    }
}
