// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{RetryPolicy, SimpleRetryPolicy};
use crate::clock::Clock;
use crate::context::{keys, AttrValue, RetryContext};
use crate::supplier::Supplier;
use crate::ERR_POISONED_LOCK;

const CIRCUIT: &str = "circuit";

/// The default window in which delegate exhaustion trips the circuit open.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(5000);

/// The default time an open circuit stays open before closing again.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Gates a delegate retry policy behind a circuit breaker.
///
/// When the delegate exhausts its attempts within the open timeout of the
/// current window, the circuit opens: every `can_retry` returns `false` and
/// increments the [`circuit.shortCount`][keys::CIRCUIT_SHORT_COUNT]
/// attribute until the reset timeout elapses, at which point the delegate
/// context is rebuilt and attempts flow again. A window that outlives the
/// open timeout without tripping is also rebuilt, so only *dense* failures
/// open the circuit.
///
/// Contexts opened by this policy carry
/// [`state.global`][keys::GLOBAL_STATE], so in stateful mode the engine
/// keeps them cached across invocations and exits the attempt loop after
/// each failure; the breaker owns reattempt timing, not the in-stack loop.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mulligan::policy::{CircuitBreakerRetryPolicy, SimpleRetryPolicy};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("downstream unavailable")]
/// struct Unavailable;
///
/// let policy: CircuitBreakerRetryPolicy<Unavailable> =
///     CircuitBreakerRetryPolicy::new(SimpleRetryPolicy::new(3))
///         .open_timeout(Duration::from_secs(2))
///         .reset_timeout(Duration::from_secs(15));
/// ```
pub struct CircuitBreakerRetryPolicy<E> {
    delegate: Arc<dyn RetryPolicy<E>>,
    open_timeout: Supplier<Duration>,
    reset_timeout: Supplier<Duration>,
    clock: Clock,
}

impl<E> CircuitBreakerRetryPolicy<E> {
    /// Wraps `delegate` with the default timeouts.
    #[must_use]
    pub fn new(delegate: impl RetryPolicy<E> + 'static) -> Self {
        Self {
            delegate: Arc::new(delegate),
            open_timeout: Supplier::Fixed(DEFAULT_OPEN_TIMEOUT),
            reset_timeout: Supplier::Fixed(DEFAULT_RESET_TIMEOUT),
            clock: Clock::new(),
        }
    }

    /// Sets the window in which delegate exhaustion opens the circuit.
    #[must_use]
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Supplier::Fixed(timeout);
        self
    }

    /// Re-evaluates the open timeout whenever a context is opened.
    #[must_use]
    pub fn open_timeout_supplier(mut self, supplier: impl Fn() -> Duration + Send + Sync + 'static) -> Self {
        self.open_timeout = Supplier::dynamic(supplier);
        self
    }

    /// Sets how long an open circuit stays open before it closes again.
    #[must_use]
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = Supplier::Fixed(timeout);
        self
    }

    /// Re-evaluates the reset timeout whenever a context is opened.
    #[must_use]
    pub fn reset_timeout_supplier(mut self, supplier: impl Fn() -> Duration + Send + Sync + 'static) -> Self {
        self.reset_timeout = Supplier::dynamic(supplier);
        self
    }

    /// Replaces the clock used to measure the breaker windows.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }
}

impl<E: Send + Sync + 'static> CircuitBreakerRetryPolicy<E> {
    fn breaker(context: &RetryContext<E>) -> Arc<BreakerState<E>> {
        context
            .attribute(CIRCUIT)
            .and_then(|value| value.downcast::<BreakerState<E>>())
            .expect("context was not opened by a circuit breaker policy")
    }

    /// Evaluates the breaker transitions and reports whether the circuit is
    /// open right now.
    fn is_open(&self, state: &BreakerState<E>, context: &RetryContext<E>) -> bool {
        let now = self.clock.instant();
        let elapsed = now.saturating_duration_since(*state.start.lock().expect(ERR_POISONED_LOCK));
        let inner = state.inner();

        let mut retryable = self.delegate.can_retry(&inner);
        if retryable {
            if elapsed > state.open_window {
                tracing::trace!("resetting circuit window");
                state.rebuild(self.delegate.as_ref(), context.parent().cloned(), now);
            }
        } else if elapsed > state.reset_timeout {
            tracing::trace!("closing circuit");
            let fresh = state.rebuild(self.delegate.as_ref(), context.parent().cloned(), now);
            retryable = self.delegate.can_retry(&fresh);
        } else if elapsed < state.open_window {
            if !context.attribute_flag(keys::CIRCUIT_OPEN) {
                tracing::trace!("opening circuit");
                context.set_attribute(keys::CIRCUIT_OPEN, true);
                *state.start.lock().expect(ERR_POISONED_LOCK) = now;
            }
            return true;
        }

        context.set_attribute(keys::CIRCUIT_OPEN, !retryable);
        !retryable
    }
}

impl<E: Send + Sync + 'static> RetryPolicy<E> for CircuitBreakerRetryPolicy<E> {
    fn open(&self, parent: Option<Arc<RetryContext<E>>>) -> Arc<RetryContext<E>> {
        let context = Arc::new(RetryContext::new(parent.clone()));
        let state = BreakerState {
            inner: Mutex::new(self.delegate.open(parent)),
            start: Mutex::new(self.clock.instant()),
            short_count: AtomicU32::new(0),
            open_window: self.open_timeout.get(),
            reset_timeout: self.reset_timeout.get(),
        };
        context.set_attribute(CIRCUIT, AttrValue::Shared(Arc::new(state)));
        context.set_attribute(keys::GLOBAL_STATE, true);
        context.set_attribute(keys::CIRCUIT_SHORT_COUNT, 0u32);
        context
    }

    fn can_retry(&self, context: &RetryContext<E>) -> bool {
        let state = Self::breaker(context);

        if self.is_open(&state, context) {
            let rejected = state.short_count.fetch_add(1, Ordering::AcqRel) + 1;
            context.set_attribute(keys::CIRCUIT_SHORT_COUNT, rejected);
            return false;
        }

        state.short_count.store(0, Ordering::Release);
        context.set_attribute(keys::CIRCUIT_SHORT_COUNT, 0u32);

        self.delegate.can_retry(&state.inner())
    }

    fn register_error(&self, context: &RetryContext<E>, error: &Arc<E>) {
        let state = Self::breaker(context);
        let inner = state.inner();
        self.delegate.register_error(&inner, error);

        // The breaker context proxies the delegate's progress so listeners
        // and the engine observe the real count and last error.
        context.mirror(inner.retry_count(), inner.last_error());
    }

    fn close(&self, context: &RetryContext<E>) {
        let state = Self::breaker(context);
        self.delegate.close(&state.inner());
    }
}

impl<E: std::error::Error + Send + Sync + 'static> Default for CircuitBreakerRetryPolicy<E> {
    /// A breaker around the default [`SimpleRetryPolicy`] with the default
    /// timeouts.
    fn default() -> Self {
        Self::new(SimpleRetryPolicy::default())
    }
}

impl<E> fmt::Debug for CircuitBreakerRetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CircuitBreakerRetryPolicy[open_timeout={:?}, reset_timeout={:?}]",
            self.open_timeout, self.reset_timeout
        )
    }
}

/// The breaker's window state, shared through the context's attribute bag
/// under a fixed key.
struct BreakerState<E> {
    inner: Mutex<Arc<RetryContext<E>>>,
    start: Mutex<Instant>,
    short_count: AtomicU32,
    open_window: Duration,
    reset_timeout: Duration,
}

impl<E> BreakerState<E> {
    fn inner(&self) -> Arc<RetryContext<E>> {
        Arc::clone(&self.inner.lock().expect(ERR_POISONED_LOCK))
    }

    fn rebuild(
        &self,
        delegate: &dyn RetryPolicy<E>,
        parent: Option<Arc<RetryContext<E>>>,
        now: Instant,
    ) -> Arc<RetryContext<E>> {
        let fresh = delegate.open(parent);
        *self.inner.lock().expect(ERR_POISONED_LOCK) = Arc::clone(&fresh);
        *self.start.lock().expect(ERR_POISONED_LOCK) = now;
        fresh
    }
}
