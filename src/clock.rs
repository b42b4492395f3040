// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::clock_control::ControlState;
use crate::ERR_POISONED_LOCK;

/// Provides an abstraction for time-related operations.
///
/// Working with time is notoriously difficult to test and control. The clock
/// enables time control in tests while adding near-zero overhead in
/// production. Backoff policies suspend the calling thread exclusively
/// through [`Clock::sleep`], and time-window policies (timeout, circuit
/// breaker) read the current time exclusively through [`Clock::instant`], so
/// a test can substitute a controlled clock and observe or skip every pause.
///
/// # State sharing between clocks
///
/// Cloning a clock is inexpensive and preserves shared state: all clones of a
/// controlled clock observe the same flow of time.
///
/// # Testing
///
/// Use [`ClockControl`][crate::ClockControl] to create a clock whose time
/// only moves when the test says so. Sleeps on a controlled clock return
/// immediately, advance the virtual time, and are recorded for inspection.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mulligan::Clock;
///
/// let clock = Clock::new();
/// let before = clock.instant();
/// clock.sleep(Duration::from_millis(1))?;
/// assert!(clock.instant() >= before);
/// # Ok::<(), mulligan::SleepInterrupted>(())
/// ```
#[derive(Debug, Clone)]
pub struct Clock(ClockInner);

#[derive(Debug, Clone)]
enum ClockInner {
    System,
    Controlled(std::sync::Arc<ControlState>),
}

impl Clock {
    /// Creates a clock backed by the operating system.
    ///
    /// Sleeps on this clock block the calling thread for real time and are
    /// never interrupted.
    #[must_use]
    pub fn new() -> Self {
        Self(ClockInner::System)
    }

    pub(crate) fn controlled(state: std::sync::Arc<ControlState>) -> Self {
        Self(ClockInner::Controlled(state))
    }

    /// Returns the current point in time according to this clock.
    #[must_use]
    pub fn instant(&self) -> Instant {
        match &self.0 {
            ClockInner::System => Instant::now(),
            ClockInner::Controlled(state) => state.instant(),
        }
    }

    /// Suspends the calling thread for at least `duration`.
    ///
    /// On the system clock this blocks the thread and always succeeds. On a
    /// controlled clock the call returns immediately, records the requested
    /// duration, and advances the virtual time, unless the control was told
    /// to interrupt sleeps, in which case [`SleepInterrupted`] is returned.
    pub fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        match &self.0 {
            ClockInner::System => {
                std::thread::sleep(duration);
                Ok(())
            }
            ClockInner::Controlled(state) => state.sleep(duration),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// A sleep was interrupted before the requested duration elapsed.
///
/// Never produced by the system clock; a controlled clock raises it when a
/// test asks for sleeps to be interrupted, and custom callers may use it to
/// deliver cancellation. The retry engine treats it as a signal to abort all
/// further attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sleep interrupted")]
pub struct SleepInterrupted;

impl ControlState {
    fn instant(&self) -> Instant {
        self.base + self.inner.lock().expect(ERR_POISONED_LOCK).offset
    }

    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);
        inner.sleeps.push(duration);
        if inner.interrupt_sleeps {
            return Err(SleepInterrupted);
        }
        inner.offset += duration;
        Ok(())
    }
}
