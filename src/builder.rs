// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{BackOffPolicy, ExponentialBackOff, FixedBackOff, NoBackOff, UniformRandomBackOff};
use crate::cache::{MapRetryContextCache, RetryContextCache};
use crate::classify::BinaryErrorClassifier;
use crate::clock::Clock;
use crate::engine::{Retry, Shared};
use crate::listener::RetryListener;
use crate::policy::{RetryPolicy, SimpleRetryPolicy};
use crate::support;

/// Configures and builds a [`Retry`] engine.
///
/// Obtained from [`Retry::builder`]. Every option has a default: three
/// attempts, every error retryable, no backoff, an in-memory context cache,
/// and no listeners.
///
/// A custom [`retry_policy`][Self::retry_policy] takes precedence over the
/// attempt-count and error-type options, which only shape the default
/// [`SimpleRetryPolicy`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use mulligan::Retry;
///
/// #[derive(Debug, thiserror::Error)]
/// enum ApiError {
///     #[error("throttled")]
///     Throttled,
///     #[error("invalid request")]
///     Invalid,
/// }
///
/// let retry = Retry::<ApiError>::builder()
///     .max_attempts(5)
///     .exponential_backoff(Duration::from_millis(100), 2.0, Duration::from_secs(10))
///     .build();
/// ```
pub struct RetryBuilder<E> {
    max_attempts: u32,
    retry_policy: Option<Arc<dyn RetryPolicy<E>>>,
    backoff: BackoffChoice,
    listeners: Vec<Arc<dyn RetryListener<E>>>,
    cache: Option<Arc<dyn RetryContextCache<E>>>,
    throw_last_error_on_exhausted: bool,
    retryable: BinaryErrorClassifier<E>,
    saw_retry_on: bool,
    saw_no_retry_on: bool,
    recoverable: BinaryErrorClassifier<E>,
    traverse_causes: bool,
    use_thread_local: Option<bool>,
    clock: Clock,
}

enum BackoffChoice {
    None,
    Fixed(Duration),
    Uniform(Duration, Duration),
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        random: bool,
    },
    Custom(Arc<dyn BackOffPolicy>),
}

impl<E: StdError + Send + Sync + 'static> RetryBuilder<E> {
    pub(crate) fn new() -> Self {
        Self {
            max_attempts: crate::policy::DEFAULT_MAX_ATTEMPTS,
            retry_policy: None,
            backoff: BackoffChoice::None,
            listeners: Vec::new(),
            cache: None,
            throw_last_error_on_exhausted: false,
            retryable: BinaryErrorClassifier::new(false),
            saw_retry_on: false,
            saw_no_retry_on: false,
            recoverable: BinaryErrorClassifier::new(true).traverse_causes(true),
            traverse_causes: false,
            use_thread_local: None,
            clock: Clock::new(),
        }
    }

    /// Bounds the total number of attempts, including the initial one.
    ///
    /// A bound of zero exhausts the retry before the first attempt.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Replaces the retry policy entirely.
    ///
    /// Overrides [`max_attempts`][Self::max_attempts] and the error-type
    /// options.
    #[must_use]
    pub fn retry_policy(mut self, policy: impl RetryPolicy<E> + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// Retries errors of type `T`.
    ///
    /// Once any type is registered this way, unregistered error types are no
    /// longer retried.
    #[must_use]
    pub fn retry_on<T: StdError + 'static>(mut self) -> Self {
        self.retryable = self.retryable.with_type::<T>(true);
        self.saw_retry_on = true;
        self
    }

    /// Never retries errors of type `T`.
    #[must_use]
    pub fn no_retry_on<T: StdError + 'static>(mut self) -> Self {
        self.retryable = self.retryable.with_type::<T>(false);
        self.saw_no_retry_on = true;
        self
    }

    /// Never passes errors of type `T` to a recovery callback; they are
    /// rethrown raw on exhaustion.
    #[must_use]
    pub fn not_recoverable<T: StdError + 'static>(mut self) -> Self {
        self.recoverable = self.recoverable.with_type::<T>(false);
        self
    }

    /// Classifies through error cause chains: an unregistered outer error is
    /// retried when a registered type appears among its sources.
    #[must_use]
    pub fn traverse_causes(mut self, enabled: bool) -> Self {
        self.traverse_causes = enabled;
        self
    }

    /// Disables pauses between attempts. This is the default.
    #[must_use]
    pub fn no_backoff(mut self) -> Self {
        self.backoff = BackoffChoice::None;
        self
    }

    /// Pauses a fixed `period` between attempts.
    #[must_use]
    pub fn fixed_backoff(mut self, period: Duration) -> Self {
        self.backoff = BackoffChoice::Fixed(period);
        self
    }

    /// Pauses a uniformly random duration in `[min, max)` between attempts.
    #[must_use]
    pub fn uniform_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff = BackoffChoice::Uniform(min, max);
        self
    }

    /// Pauses an exponentially growing duration between attempts.
    #[must_use]
    pub fn exponential_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.backoff = BackoffChoice::Exponential {
            initial,
            multiplier,
            max,
            random: false,
        };
        self
    }

    /// Exponential backoff with a random jitter on every pause.
    #[must_use]
    pub fn exponential_random_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.backoff = BackoffChoice::Exponential {
            initial,
            multiplier,
            max,
            random: true,
        };
        self
    }

    /// Replaces the backoff policy entirely.
    #[must_use]
    pub fn backoff(mut self, policy: impl BackOffPolicy + 'static) -> Self {
        self.backoff = BackoffChoice::Custom(Arc::new(policy));
        self
    }

    /// Registers a listener. Listeners are notified in the order given here
    /// for `open` and in reverse order for the remaining hooks.
    #[must_use]
    pub fn listener(mut self, listener: impl RetryListener<E> + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Registers an already-shared listener.
    #[must_use]
    pub fn listener_arc(mut self, listener: Arc<impl RetryListener<E> + 'static>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Replaces the stateful-retry context cache.
    #[must_use]
    pub fn context_cache(mut self, cache: impl RetryContextCache<E> + 'static) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// On stateful exhaustion without recovery, rethrows the last error raw
    /// instead of wrapping it in
    /// [`RetryError::Exhausted`][crate::RetryError::Exhausted].
    #[must_use]
    pub fn throw_last_error_on_exhausted(mut self, enabled: bool) -> Self {
        self.throw_last_error_on_exhausted = enabled;
        self
    }

    /// Chooses the storage of the active-context registry; see
    /// [`support::set_use_thread_local`].
    ///
    /// The switch is process-wide and applied when [`build`][Self::build]
    /// runs.
    #[must_use]
    pub fn use_thread_local(mut self, enabled: bool) -> Self {
        self.use_thread_local = Some(enabled);
        self
    }

    /// The clock backing the built-in backoff policies, for tests that
    /// control time.
    ///
    /// Custom [`retry_policy`][Self::retry_policy] and
    /// [`backoff`][Self::backoff] instances carry their own clocks.
    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the engine.
    #[must_use]
    pub fn build(self) -> Retry<E> {
        if let Some(enabled) = self.use_thread_local {
            support::set_use_thread_local(enabled);
        }

        let retry_policy: Arc<dyn RetryPolicy<E>> = match self.retry_policy {
            Some(policy) => policy,
            None => {
                // retry_on flips the default: only registered types retry.
                // With no_retry_on alone (or no rules), everything else
                // retries.
                let retryable = if self.saw_retry_on || self.saw_no_retry_on {
                    let default_value = !self.saw_retry_on;
                    self.retryable
                        .with_default_value(default_value)
                        .traverse_causes(self.traverse_causes)
                } else {
                    BinaryErrorClassifier::new(true)
                };

                Arc::new(
                    SimpleRetryPolicy::new(self.max_attempts)
                        .classifier(retryable)
                        .recoverable_classifier(self.recoverable),
                )
            }
        };

        let backoff_policy: Arc<dyn BackOffPolicy> = match self.backoff {
            BackoffChoice::None => Arc::new(NoBackOff),
            BackoffChoice::Fixed(period) => Arc::new(FixedBackOff::new(period).with_clock(self.clock)),
            BackoffChoice::Uniform(min, max) => {
                Arc::new(UniformRandomBackOff::new(min, max).with_clock(self.clock))
            }
            BackoffChoice::Exponential {
                initial,
                multiplier,
                max,
                random,
            } => Arc::new(
                ExponentialBackOff::new()
                    .initial_interval(initial)
                    .multiplier(multiplier)
                    .max_interval(max)
                    .random(random)
                    .with_clock(self.clock),
            ),
            BackoffChoice::Custom(policy) => policy,
        };

        Retry::from_shared(Shared {
            retry_policy,
            backoff_policy,
            listeners: self.listeners,
            cache: self.cache.unwrap_or_else(|| Arc::new(MapRetryContextCache::new())),
            throw_last_error_on_exhausted: self.throw_last_error_on_exhausted,
        })
    }
}

impl<E> fmt::Debug for RetryBuilder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryBuilder")
            .field("max_attempts", &self.max_attempts)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::testing::StubError;
    use crate::{ClockControl, RetryError};

    #[derive(Debug)]
    struct OtherError;

    impl fmt::Display for OtherError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "other")
        }
    }

    impl StdError for OtherError {}

    #[test]
    fn default_build_retries_three_times() {
        let retry = Retry::<StubError>::builder().build();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        retry
            .execute::<u32, _>(move |_ctx| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Err(StubError::transient())
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_on_restricts_to_registered_types() {
        let retry = Retry::<StubError>::builder().max_attempts(5).retry_on::<OtherError>().build();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        // StubError is not registered, so it no longer retries.
        retry
            .execute::<u32, _>(move |_ctx| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Err(StubError::transient())
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_retry_on_keeps_the_rest_retryable() {
        let retry = Retry::<StubError>::builder().max_attempts(3).no_retry_on::<OtherError>().build();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        retry
            .execute::<u32, _>(move |_ctx| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Err(StubError::transient())
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fixed_backoff_uses_the_builder_clock() {
        let control = ClockControl::new();
        let retry = Retry::<StubError>::builder()
            .max_attempts(3)
            .clock(control.to_clock())
            .fixed_backoff(Duration::from_millis(25))
            .build();

        retry.execute::<u32, _>(|_ctx| Err(StubError::transient())).unwrap_err();

        assert_eq!(
            control.sleeps(),
            vec![Duration::from_millis(25), Duration::from_millis(25)]
        );
    }

    #[test]
    fn exponential_backoff_grows_per_schedule() {
        let control = ClockControl::new();
        let retry = Retry::<StubError>::builder()
            .max_attempts(4)
            .clock(control.to_clock())
            .exponential_backoff(Duration::from_millis(10), 2.0, Duration::from_secs(1))
            .build();

        retry.execute::<u32, _>(|_ctx| Err(StubError::transient())).unwrap_err();

        assert_eq!(
            control.sleeps(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
            ]
        );
    }

    #[test]
    fn not_recoverable_reaches_the_default_policy() {
        let retry = Retry::<StubError>::builder().max_attempts(1).not_recoverable::<StubError>().build();

        let result: Result<u32, _> =
            retry.execute_with_recovery(|_ctx| Err(StubError::fatal()), |_ctx| Ok(1));

        assert!(matches!(result.unwrap_err(), RetryError::Error(_)));
    }
}
