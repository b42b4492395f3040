// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backoff::{BackOffContext, BackOffPolicy};
use crate::builder::RetryBuilder;
use crate::cache::RetryContextCache;
use crate::context::{keys, AttrValue, RetryContext};
use crate::error::{RetryError, INCONSISTENT_KEY_CHANGED, INCONSISTENT_NO_HISTORY};
use crate::listener::RetryListener;
use crate::policy::RetryPolicy;
use crate::state::RetryState;
use crate::support;

/// Executes fallible operations with retry semantics.
///
/// The engine runs a user-supplied operation, consults its
/// [`RetryPolicy`][crate::policy::RetryPolicy] to decide whether to try
/// again, consults its [`BackOffPolicy`][crate::backoff::BackOffPolicy] to
/// decide how long to pause between attempts, and, when attempts are
/// exhausted, optionally invokes a recovery callback. Supplying a
/// [`RetryState`] switches an execution into stateful mode: the context is
/// cached by key and the same logical failure can be retried across separate
/// top-level invocations.
///
/// By default an engine retries every error up to three attempts with no
/// pause in between. Configure it through [`Retry::builder`].
///
/// The engine is immutable once built and cheap to clone: clones share the
/// same configuration and context cache. Executions on different threads
/// proceed independently, each with its own context.
///
/// # Examples
///
/// ```
/// use mulligan::Retry;
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("flaky")]
/// struct Flaky;
///
/// let retry = Retry::<Flaky>::builder().max_attempts(3).build();
///
/// let mut calls = 0;
/// let result = retry.execute(|_ctx| {
///     calls += 1;
///     if calls < 3 { Err(Flaky) } else { Ok("done") }
/// });
///
/// assert_eq!(result.unwrap(), "done");
/// assert_eq!(calls, 3);
/// ```
pub struct Retry<E> {
    shared: Arc<Shared<E>>,
}

pub(crate) struct Shared<E> {
    pub(crate) retry_policy: Arc<dyn RetryPolicy<E>>,
    pub(crate) backoff_policy: Arc<dyn BackOffPolicy>,
    pub(crate) listeners: Vec<Arc<dyn RetryListener<E>>>,
    pub(crate) cache: Arc<dyn RetryContextCache<E>>,
    pub(crate) throw_last_error_on_exhausted: bool,
}

impl<E> Clone for Retry<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> fmt::Debug for Retry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("listeners", &self.shared.listeners.len())
            .field("throw_last_error_on_exhausted", &self.shared.throw_last_error_on_exhausted)
            .finish_non_exhaustive()
    }
}

impl<E: StdError + Send + Sync + 'static> Default for Retry<E> {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl<E: StdError + Send + Sync + 'static> Retry<E> {
    pub(crate) fn from_shared(shared: Shared<E>) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Starts configuring a new engine.
    #[must_use]
    pub fn builder() -> RetryBuilder<E> {
        RetryBuilder::new()
    }

    /// Runs `op` until it succeeds or the retry policy gives up, then
    /// propagates the last error.
    pub fn execute<T, F>(&self, op: F) -> Result<T, RetryError<E>>
    where
        T: 'static,
        F: FnMut(&RetryContext<E>) -> Result<T, E>,
    {
        self.do_execute(op, None::<Recovery<T, E>>, None)
    }

    /// Runs `op` until it succeeds or the retry policy gives up, then falls
    /// back to `recovery`.
    ///
    /// The recovery callback's own error is propagated raw.
    pub fn execute_with_recovery<T, F, R>(&self, op: F, recovery: R) -> Result<T, RetryError<E>>
    where
        T: 'static,
        F: FnMut(&RetryContext<E>) -> Result<T, E>,
        R: FnOnce(&RetryContext<E>) -> Result<T, E>,
    {
        self.do_execute(op, Some(recovery), None)
    }

    /// Runs `op` in stateful mode: the context is cached under
    /// `state.key()` and failures that classify for rollback are rethrown so
    /// a later invocation with an equal key resumes the same context.
    pub fn execute_stateful<T, F>(&self, op: F, state: &RetryState<E>) -> Result<T, RetryError<E>>
    where
        T: 'static,
        F: FnMut(&RetryContext<E>) -> Result<T, E>,
    {
        self.do_execute(op, None::<Recovery<T, E>>, Some(state))
    }

    /// Stateful execution with a recovery fallback once attempts are
    /// exhausted.
    pub fn execute_stateful_with_recovery<T, F, R>(
        &self,
        op: F,
        recovery: R,
        state: &RetryState<E>,
    ) -> Result<T, RetryError<E>>
    where
        T: 'static,
        F: FnMut(&RetryContext<E>) -> Result<T, E>,
        R: FnOnce(&RetryContext<E>) -> Result<T, E>,
    {
        self.do_execute(op, Some(recovery), Some(state))
    }

    fn do_execute<T, F, R>(
        &self,
        mut op: F,
        recovery: Option<R>,
        state: Option<&RetryState<E>>,
    ) -> Result<T, RetryError<E>>
    where
        T: 'static,
        F: FnMut(&RetryContext<E>) -> Result<T, E>,
        R: FnOnce(&RetryContext<E>) -> Result<T, E>,
    {
        let policy = Arc::clone(&self.shared.retry_policy);
        let backoff = Arc::clone(&self.shared.backoff_policy);

        let context = self.open_context(policy.as_ref(), state)?;
        trace!(context = ?context, "retry context retrieved");

        support::register(Arc::clone(&context));

        let mut last_error: Option<Arc<E>> = None;
        let mut exhausted = false;

        let result = (|| {
            if !self.shared.listeners.iter().all(|listener| listener.open(&context)) {
                return Err(RetryError::Terminated);
            }

            if !context.has_attribute(keys::MAX_ATTEMPTS) {
                if let Some(max_attempts) = policy.max_attempts() {
                    context.set_attribute(keys::MAX_ATTEMPTS, max_attempts);
                }
            }

            // A cached stateful context resumes its backoff schedule where
            // the previous invocation left it.
            let backoff_context = self.resume_or_start_backoff(backoff.as_ref(), &context);

            // The whole loop is skipped when the policy already forbids the
            // first try; an external retry then recovers in the exhausted
            // path without running the operation again.
            while policy.can_retry(&context) && !context.is_exhausted_only() {
                // Reset the last error so a success is not mistaken for a
                // failure by the close listeners.
                last_error = None;

                match op(&context) {
                    Ok(result) => {
                        for listener in self.shared.listeners.iter().rev() {
                            listener.on_success(&context, &result);
                        }
                        return Ok(result);
                    }
                    Err(error) => {
                        let error = Arc::new(error);
                        last_error = Some(Arc::clone(&error));

                        policy.register_error(&context, &error);
                        let registered = self.register_context(&context, state);
                        for listener in self.shared.listeners.iter().rev() {
                            listener.on_error(&context, &error);
                        }
                        registered?;

                        if policy.can_retry(&context) && !context.is_exhausted_only() {
                            if let Err(interrupted) = backoff.back_off(backoff_context.as_ref()) {
                                debug!(count = context.retry_count(), "aborting retry: backoff interrupted");
                                return Err(RetryError::Interrupted(interrupted));
                            }
                        }

                        if Self::should_rethrow(state, &error) {
                            return Err(RetryError::Error(error));
                        }
                    }
                }

                // A global stateful context (circuit breaker) exits the
                // in-stack loop after every failure; the breaker owns the
                // reattempt timing across invocations.
                if state.is_some() && context.attribute_flag(keys::GLOBAL_STATE) {
                    break;
                }
            }

            if state.is_none() {
                debug!(count = context.retry_count(), "retry failed last attempt");
            }

            exhausted = true;
            self.handle_exhausted(recovery, &context, state)
        })();

        self.close_context(policy.as_ref(), &context, state, last_error.is_none() || exhausted);
        for listener in self.shared.listeners.iter().rev() {
            listener.close(&context, last_error.as_deref());
        }
        support::clear::<E>();

        result
    }

    /// Opens a context via the policy, consulting the cache in stateful
    /// mode.
    fn open_context(
        &self,
        policy: &dyn RetryPolicy<E>,
        state: Option<&RetryState<E>>,
    ) -> Result<Arc<RetryContext<E>>, RetryError<E>> {
        let Some(state) = state else {
            return self.open_fresh(policy, None);
        };

        if state.is_force_refresh() || !self.shared.cache.contains_key(state.key()) {
            return self.open_fresh(policy, Some(state));
        }

        match self.shared.cache.get(state.key()) {
            Some(context) => {
                // A resumed context must not carry verdicts from the
                // previous invocation.
                context.remove_attribute(keys::CLOSED);
                context.remove_attribute(keys::EXHAUSTED);
                context.remove_attribute(keys::RECOVERED);
                Ok(context)
            }
            None if self.shared.cache.contains_key(state.key()) => {
                Err(RetryError::InconsistentCache(INCONSISTENT_NO_HISTORY))
            }
            // The entry expired between the contains check and the get;
            // open a fresh context.
            None => self.open_fresh(policy, Some(state)),
        }
    }

    fn open_fresh(
        &self,
        policy: &dyn RetryPolicy<E>,
        state: Option<&RetryState<E>>,
    ) -> Result<Arc<RetryContext<E>>, RetryError<E>> {
        let parent = support::current_context::<E>();
        let context = policy.open(parent);

        if let Some(state) = state {
            context.set_attribute(keys::STATE_KEY, state.key().clone());
        }

        if context.attribute_flag(keys::GLOBAL_STATE) {
            // A global context survives individual executions, so it must be
            // visible in the cache from the start.
            self.register_context(&context, state)?;
        }

        Ok(context)
    }

    /// Publishes the context in the cache under the state's key.
    fn register_context(&self, context: &Arc<RetryContext<E>>, state: Option<&RetryState<E>>) -> Result<(), RetryError<E>> {
        let Some(state) = state else { return Ok(()) };

        if context.retry_count() > 1 && !self.shared.cache.contains_key(state.key()) {
            return Err(RetryError::InconsistentCache(INCONSISTENT_KEY_CHANGED));
        }

        self.shared
            .cache
            .put(state.key().clone(), Arc::clone(context))
            .map_err(RetryError::CacheCapacity)
    }

    fn resume_or_start_backoff(
        &self,
        backoff: &dyn BackOffPolicy,
        context: &RetryContext<E>,
    ) -> Option<BackOffContext> {
        let resumed = context
            .attribute(keys::BACKOFF_CONTEXT)
            .and_then(|value| value.downcast::<BackOffContext>())
            .map(|shared| (*shared).clone());
        if resumed.is_some() {
            return resumed;
        }

        let started = backoff.start();
        if let Some(started) = &started {
            context.set_attribute(keys::BACKOFF_CONTEXT, AttrValue::Shared(Arc::new(started.clone())));
        }
        started
    }

    fn should_rethrow(state: Option<&RetryState<E>>, error: &Arc<E>) -> bool {
        state.is_some_and(|state| state.rollback_for(error))
    }

    /// Terminal handling once no further attempts are permitted.
    fn handle_exhausted<T, R>(
        &self,
        recovery: Option<R>,
        context: &Arc<RetryContext<E>>,
        state: Option<&RetryState<E>>,
    ) -> Result<T, RetryError<E>>
    where
        R: FnOnce(&RetryContext<E>) -> Result<T, E>,
    {
        context.set_attribute(keys::EXHAUSTED, true);

        if let Some(state) = state {
            if !context.attribute_flag(keys::GLOBAL_STATE) {
                self.shared.cache.remove(state.key());
            }
        }

        let do_recover = !context.attribute_flag(keys::NO_RECOVERY);
        if let Some(recovery) = recovery {
            if do_recover {
                let recovered = recovery(context).map_err(|error| RetryError::Error(Arc::new(error)))?;
                context.set_attribute(keys::RECOVERED, true);
                return Ok(recovered);
            }
            debug!("retry exhausted and recovery disabled for this error");
        }

        let last = context.last_error();
        if state.is_some() {
            debug!("retry exhausted after last attempt with no recovery path");
            if !self.shared.throw_last_error_on_exhausted && do_recover {
                return Err(RetryError::Exhausted(last));
            }
        }

        Err(match last {
            Some(error) => RetryError::Error(error),
            None => RetryError::Exhausted(None),
        })
    }

    /// Cleans up the cache if necessary and closes the context when the
    /// execution concluded.
    fn close_context(
        &self,
        policy: &dyn RetryPolicy<E>,
        context: &Arc<RetryContext<E>>,
        state: Option<&RetryState<E>>,
        concluded: bool,
    ) {
        match state {
            Some(state) => {
                // A stateful context that merely rolled back stays open in
                // the cache for the next invocation.
                if concluded {
                    if !context.attribute_flag(keys::GLOBAL_STATE) {
                        self.shared.cache.remove(state.key());
                    }
                    policy.close(context);
                    context.set_attribute(keys::CLOSED, true);
                }
            }
            None => {
                policy.close(context);
                context.set_attribute(keys::CLOSED, true);
            }
        }
    }
}

/// Turbofish helper naming the "no recovery" callback type.
type Recovery<T, E> = fn(&RetryContext<E>) -> Result<T, E>;

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::backoff::FixedBackOff;
    use crate::policy::SimpleRetryPolicy;
    use crate::testing::{RecordingListener, StubError};
    use crate::{BinaryErrorClassifier, ClockControl, RetryKey};

    assert_impl_all!(Retry<StubError>: Send, Sync, Clone);

    fn failing_n_times(failures: u32) -> (Arc<AtomicU32>, impl FnMut(&RetryContext<StubError>) -> Result<u32, StubError>) {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let op = move |_ctx: &RetryContext<StubError>| {
            let call = calls_clone.fetch_add(1, Ordering::SeqCst);
            if call < failures {
                Err(StubError::transient())
            } else {
                Ok(42)
            }
        };
        (calls, op)
    }

    #[test]
    fn first_attempt_success_needs_no_retries() {
        let retry = Retry::<StubError>::builder().build();
        let (calls, op) = failing_n_times(0);

        assert_eq!(retry.execute(op).unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_until_success_within_bound() {
        let retry = Retry::<StubError>::builder().max_attempts(3).build();
        let (calls, op) = failing_n_times(2);

        assert_eq!(retry.execute(op).unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhaustion_propagates_the_last_error_raw() {
        let retry = Retry::<StubError>::builder().max_attempts(2).build();
        let (calls, op) = failing_n_times(10);

        let error = retry.execute(op).unwrap_err();

        assert!(matches!(error, RetryError::Error(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn recovery_runs_on_exhaustion_and_marks_the_context() {
        let retry = Retry::<StubError>::builder().max_attempts(2).build();
        let (calls, op) = failing_n_times(10);

        let recovered = Arc::new(Mutex::new(None));
        let recovered_clone = Arc::clone(&recovered);
        let result = retry.execute_with_recovery(op, move |ctx| {
            *recovered_clone.lock().unwrap() =
                Some((ctx.attribute_flag(keys::EXHAUSTED), ctx.retry_count()));
            Ok(7)
        });

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*recovered.lock().unwrap(), Some((true, 2)));
    }

    #[test]
    fn recovery_error_propagates_raw() {
        let retry = Retry::<StubError>::builder().max_attempts(1).build();

        let result: Result<u32, _> = retry.execute_with_recovery(
            |_ctx| Err(StubError::transient()),
            |_ctx| Err(StubError::fatal()),
        );

        let error = result.unwrap_err();
        assert!(matches!(error, RetryError::Error(ref e) if e.is_fatal()));
    }

    #[test]
    fn zero_attempts_is_exhausted_without_invoking_op() {
        let retry = Retry::<StubError>::builder().max_attempts(0).build();
        let (calls, op) = failing_n_times(0);

        let error = retry.execute(op).unwrap_err();

        assert!(matches!(error, RetryError::Exhausted(None)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn single_attempt_never_backs_off() {
        let control = ClockControl::new();
        let retry = Retry::<StubError>::builder()
            .max_attempts(1)
            .backoff(FixedBackOff::new(Duration::from_millis(10)).with_clock(control.to_clock()))
            .build();
        let (calls, op) = failing_n_times(10);

        retry.execute(op).unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(control.sleeps().is_empty());
    }

    #[test]
    fn backoff_runs_between_attempts_but_not_after_the_last() {
        let control = ClockControl::new();
        let retry = Retry::<StubError>::builder()
            .max_attempts(3)
            .backoff(FixedBackOff::new(Duration::from_millis(10)).with_clock(control.to_clock()))
            .build();
        let (_, op) = failing_n_times(10);

        retry.execute(op).unwrap_err();

        assert_eq!(
            control.sleeps(),
            vec![Duration::from_millis(10), Duration::from_millis(10)]
        );
    }

    #[test]
    fn interrupted_backoff_aborts_retries() {
        let control = ClockControl::new();
        control.interrupt_sleeps(true);
        let retry = Retry::<StubError>::builder()
            .max_attempts(5)
            .backoff(FixedBackOff::new(Duration::from_millis(10)).with_clock(control.to_clock()))
            .build();
        let (calls, op) = failing_n_times(10);

        let error = retry.execute(op).unwrap_err();

        assert!(matches!(error, RetryError::Interrupted(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn operation_can_force_exhaustion() {
        let retry = Retry::<StubError>::builder().max_attempts(10).build();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let error = retry
            .execute::<u32, _>(move |ctx| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                ctx.set_exhausted_only();
                Err(StubError::transient())
            })
            .unwrap_err();

        assert!(matches!(error, RetryError::Error(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_veto_terminates_before_the_first_attempt() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let retry = Retry::<StubError>::builder()
            .listener_arc(RecordingListener::rejecting("a", Arc::clone(&events)))
            .build();
        let (calls, op) = failing_n_times(0);

        let error = retry.execute(op).unwrap_err();

        assert!(matches!(error, RetryError::Terminated));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // The close hook still fires exactly once.
        assert_eq!(*events.lock().unwrap(), vec!["a:open", "a:close"]);
    }

    #[test]
    fn listener_ordering_is_fifo_open_lifo_rest() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let retry = Retry::<StubError>::builder()
            .listener_arc(RecordingListener::new("a", Arc::clone(&events)))
            .listener_arc(RecordingListener::new("b", Arc::clone(&events)))
            .max_attempts(2)
            .build();
        let (_, op) = failing_n_times(1);

        retry.execute(op).unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "a:open", "b:open", // registration order
                "b:on_error", "a:on_error", // reverse order
                "b:on_success", "a:on_success",
                "b:close", "a:close",
            ]
        );
    }

    #[test]
    fn success_notifies_result_to_listeners() {
        struct Downcasting {
            seen: Arc<Mutex<Option<u32>>>,
        }

        impl RetryListener<StubError> for Downcasting {
            fn on_success(&self, _context: &RetryContext<StubError>, result: &dyn std::any::Any) {
                *self.seen.lock().unwrap() = result.downcast_ref::<u32>().copied();
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let retry = Retry::<StubError>::builder()
            .listener(Downcasting { seen: Arc::clone(&seen) })
            .build();

        retry.execute(|_ctx| Ok(42u32)).unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn context_is_published_on_the_thread_registry() {
        let retry = Retry::<StubError>::builder().build();

        retry
            .execute(|ctx| {
                let current = support::current_context::<StubError>().unwrap();
                assert!(std::ptr::eq(&*current, ctx));
                Ok::<_, StubError>(())
            })
            .unwrap();

        assert!(support::current_context::<StubError>().is_none());
    }

    #[test]
    fn context_is_closed_before_close_listeners_fire() {
        struct CloseProbe {
            seen: Arc<Mutex<Option<bool>>>,
        }

        impl RetryListener<StubError> for CloseProbe {
            fn close(&self, context: &RetryContext<StubError>, _last: Option<&StubError>) {
                *self.seen.lock().unwrap() = Some(context.attribute_flag(keys::CLOSED));
            }
        }

        let seen = Arc::new(Mutex::new(None));
        let retry = Retry::<StubError>::builder()
            .max_attempts(1)
            .listener(CloseProbe { seen: Arc::clone(&seen) })
            .build();

        retry.execute(|_ctx| Ok::<_, StubError>(())).unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn max_attempts_attribute_is_published() {
        let retry = Retry::<StubError>::builder().max_attempts(7).build();

        retry
            .execute(|ctx| {
                assert_eq!(ctx.attribute(keys::MAX_ATTEMPTS).and_then(|v| v.as_int()), Some(7));
                Ok::<_, StubError>(())
            })
            .unwrap();
    }

    #[test]
    fn non_retryable_error_short_circuits() {
        let retry = Retry::<StubError>::builder()
            .retry_policy(
                SimpleRetryPolicy::new(5).classifier(BinaryErrorClassifier::<StubError>::new(false)),
            )
            .build();
        let (calls, op) = failing_n_times(10);

        let error = retry.execute(op).unwrap_err();

        assert!(matches!(error, RetryError::Error(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_recoverable_error_bypasses_recovery() {
        let retry = Retry::<StubError>::builder()
            .retry_policy(SimpleRetryPolicy::<StubError>::new(1).not_recoverable::<StubError>())
            .build();

        let result: Result<u32, _> =
            retry.execute_with_recovery(|_ctx| Err(StubError::fatal()), |_ctx| Ok(99));

        // The recovery callback is skipped and the error propagates raw.
        let error = result.unwrap_err();
        assert!(matches!(error, RetryError::Error(ref e) if e.is_fatal()));
    }

    #[test]
    fn nested_executions_link_contexts() {
        let outer = Retry::<StubError>::builder().build();
        let inner = Retry::<StubError>::builder().build();

        outer
            .execute(|outer_ctx| {
                inner
                    .execute(|inner_ctx| {
                        assert!(std::ptr::eq(&**inner_ctx.parent().unwrap(), outer_ctx));
                        Ok::<_, StubError>(())
                    })
                    .unwrap();
                Ok::<_, StubError>(())
            })
            .unwrap();
    }

    #[test]
    fn stateful_rollback_rethrows_and_caches() {
        let retry = Retry::<StubError>::builder().max_attempts(3).build();
        let state = RetryState::new(RetryKey::new("k1"));

        let error = retry
            .execute_stateful(|_ctx| Err::<u32, _>(StubError::transient()), &state)
            .unwrap_err();

        assert!(matches!(error, RetryError::Error(_)));

        // The context stayed cached, so the next invocation resumes it.
        retry
            .execute_stateful(
                |ctx| {
                    assert_eq!(ctx.retry_count(), 1);
                    Ok::<_, StubError>(())
                },
                &state,
            )
            .unwrap();
    }

    #[test]
    fn stateful_success_clears_the_cache_entry() {
        let retry = Retry::<StubError>::builder().build();
        let state = RetryState::new(RetryKey::new("k2"));

        retry
            .execute_stateful(|_ctx| Err::<u32, _>(StubError::transient()), &state)
            .unwrap_err();
        retry.execute_stateful(|_ctx| Ok::<_, StubError>(1), &state).unwrap();

        // A third invocation starts from a fresh context.
        retry
            .execute_stateful(
                |ctx| {
                    assert_eq!(ctx.retry_count(), 0);
                    Ok::<_, StubError>(())
                },
                &state,
            )
            .unwrap();
    }

    #[test]
    fn stateful_no_rollback_retries_in_stack() {
        let retry = Retry::<StubError>::builder().max_attempts(3).build();
        let state = RetryState::new(RetryKey::new("k3")).rollback_when(|_| false);
        let (calls, op) = failing_n_times(2);

        assert_eq!(retry.execute_stateful(op, &state).unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn force_refresh_ignores_the_cached_context() {
        let retry = Retry::<StubError>::builder().max_attempts(3).build();

        let state = RetryState::new(RetryKey::new("k4"));
        retry
            .execute_stateful(|_ctx| Err::<u32, _>(StubError::transient()), &state)
            .unwrap_err();

        let refreshed = RetryState::new(RetryKey::new("k4")).force_refresh(true);
        retry
            .execute_stateful(
                |ctx| {
                    assert_eq!(ctx.retry_count(), 0);
                    Ok::<_, StubError>(())
                },
                &refreshed,
            )
            .unwrap();
    }

    #[test]
    fn stateful_exhaustion_without_recovery_wraps() {
        let retry = Retry::<StubError>::builder().max_attempts(1).build();
        let state = RetryState::new(RetryKey::new("k5"));

        retry
            .execute_stateful(|_ctx| Err::<u32, _>(StubError::transient()), &state)
            .unwrap_err();

        // Attempts consumed; the loop is skipped and exhaustion reported.
        let error = retry
            .execute_stateful(|_ctx| Err::<u32, _>(StubError::transient()), &state)
            .unwrap_err();

        assert!(error.is_exhausted());
        assert!(error.last_error().is_some());
    }

    #[test]
    fn stateful_exhaustion_can_rethrow_raw() {
        let retry = Retry::<StubError>::builder()
            .max_attempts(1)
            .throw_last_error_on_exhausted(true)
            .build();
        let state = RetryState::new(RetryKey::new("k6"));

        retry
            .execute_stateful(|_ctx| Err::<u32, _>(StubError::transient()), &state)
            .unwrap_err();
        let error = retry
            .execute_stateful(|_ctx| Err::<u32, _>(StubError::transient()), &state)
            .unwrap_err();

        assert!(matches!(error, RetryError::Error(_)));
    }

    #[test]
    fn cache_capacity_error_surfaces() {
        let retry = Retry::<StubError>::builder()
            .context_cache(crate::MapRetryContextCache::with_capacity(0))
            .build();
        let state = RetryState::new(RetryKey::new("k7"));

        let error = retry
            .execute_stateful(|_ctx| Err::<u32, _>(StubError::transient()), &state)
            .unwrap_err();

        assert!(matches!(error, RetryError::CacheCapacity(_)));
    }
}
