// Copyright (c) Microsoft Corporation.

use std::sync::Arc;
use std::time::Duration;

use super::RetryPolicy;
use crate::clock::Clock;
use crate::context::RetryContext;
use crate::supplier::Supplier;

const TIMEOUT_START: &str = "timeout.start";

/// The default retry time budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Retries on any error while a time budget since the context opened holds.
///
/// `can_retry` holds while the elapsed time is strictly below the timeout.
/// The clock is only consulted at decision points; an attempt that starts
/// inside the budget runs to completion.
#[derive(Debug, Clone)]
pub struct TimeoutRetryPolicy {
    timeout: Supplier<Duration>,
    clock: Clock,
}

impl TimeoutRetryPolicy {
    /// Creates a policy allowing retries for `timeout` after the context
    /// opens.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: Supplier::Fixed(timeout),
            clock: Clock::new(),
        }
    }

    /// Re-evaluates the time budget on every check.
    #[must_use]
    pub fn with_supplier(supplier: impl Fn() -> Duration + Send + Sync + 'static) -> Self {
        Self {
            timeout: Supplier::dynamic(supplier),
            clock: Clock::new(),
        }
    }

    /// Replaces the clock used to measure elapsed time.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The current time budget.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout.get()
    }
}

impl Default for TimeoutRetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl<E: Send + Sync> RetryPolicy<E> for TimeoutRetryPolicy {
    fn open(&self, parent: Option<Arc<RetryContext<E>>>) -> Arc<RetryContext<E>> {
        let context = Arc::new(RetryContext::new(parent));
        context.set_attribute(TIMEOUT_START, self.clock.instant());
        context
    }

    fn can_retry(&self, context: &RetryContext<E>) -> bool {
        let start = context
            .attribute(TIMEOUT_START)
            .and_then(|value| value.as_instant())
            .expect("timeout context is missing its start instant");

        self.clock.instant().saturating_duration_since(start) < self.timeout.get()
    }

    fn register_error(&self, context: &RetryContext<E>, error: &Arc<E>) {
        context.register_error(Some(Arc::clone(error)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubError;
    use crate::ClockControl;

    #[test]
    fn allows_retries_inside_the_budget() {
        let control = ClockControl::new();
        let policy = TimeoutRetryPolicy::new(Duration::from_millis(100)).with_clock(control.to_clock());
        let context = RetryPolicy::<StubError>::open(&policy, None);

        assert!(RetryPolicy::<StubError>::can_retry(&policy, &context));

        control.advance(Duration::from_millis(99));
        assert!(RetryPolicy::<StubError>::can_retry(&policy, &context));
    }

    #[test]
    fn rejects_once_the_budget_elapses() {
        let control = ClockControl::new();
        let policy = TimeoutRetryPolicy::new(Duration::from_millis(100)).with_clock(control.to_clock());
        let context = RetryPolicy::<StubError>::open(&policy, None);

        control.advance(Duration::from_millis(100));

        assert!(!RetryPolicy::<StubError>::can_retry(&policy, &context));
    }

    #[test]
    fn failures_count_but_do_not_decide() {
        let control = ClockControl::new();
        let policy = TimeoutRetryPolicy::new(Duration::from_secs(1)).with_clock(control.to_clock());
        let context = RetryPolicy::<StubError>::open(&policy, None);

        for _ in 0..10 {
            policy.register_error(&context, &Arc::new(StubError::fatal()));
        }

        assert_eq!(context.retry_count(), 10);
        assert!(RetryPolicy::<StubError>::can_retry(&policy, &context));
    }
}
