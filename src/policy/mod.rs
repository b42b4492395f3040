// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Retry policies deciding whether a failed operation may be attempted
//! again.
//!
//! A policy owns the lifecycle of the [`RetryContext`]: it opens one per
//! execution, is consulted before every attempt, records each failure, and
//! closes the context when the execution ends. Policies compose: a
//! [`CompositeRetryPolicy`] combines verdicts with AND or OR semantics, and
//! a [`CircuitBreakerRetryPolicy`] wraps any delegate with failure-density
//! gating.

mod circuit_breaker;
mod classifier;
mod composite;
mod max_attempts;
mod simple;
mod timeout;

use std::sync::Arc;

pub use circuit_breaker::{CircuitBreakerRetryPolicy, DEFAULT_OPEN_TIMEOUT, DEFAULT_RESET_TIMEOUT};
pub use classifier::ClassifierRetryPolicy;
pub use composite::CompositeRetryPolicy;
pub use max_attempts::MaxAttemptsRetryPolicy;
pub use simple::{SimpleRetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use timeout::{TimeoutRetryPolicy, DEFAULT_TIMEOUT};

use crate::context::RetryContext;

/// Decides whether the engine may try the operation again.
pub trait RetryPolicy<E>: Send + Sync {
    /// Allocates the context for a new execution, optionally nested under a
    /// `parent` context.
    ///
    /// The default produces a plain context; policies that carry
    /// per-execution state attach it here.
    fn open(&self, parent: Option<Arc<RetryContext<E>>>) -> Arc<RetryContext<E>> {
        Arc::new(RetryContext::new(parent))
    }

    /// Whether another attempt may run *now*.
    ///
    /// Called before the first attempt (on a context with no failures) and
    /// after every registered failure.
    fn can_retry(&self, context: &RetryContext<E>) -> bool;

    /// Records a failed attempt.
    ///
    /// Must increment the context's retry count exactly once, by delegating
    /// to [`RetryContext::register_error`].
    fn register_error(&self, context: &RetryContext<E>, error: &Arc<E>);

    /// Releases any resources held by the context. Closing twice is a
    /// no-op.
    fn close(&self, context: &RetryContext<E>) {
        let _ = context;
    }

    /// The attempt bound this policy enforces, when it has one.
    fn max_attempts(&self) -> Option<u32> {
        None
    }
}

/// Allows exactly one attempt.
///
/// `can_retry` holds only before the first failure is registered; the first
/// failure ends the execution. Useful as the base policy for stateful
/// dispatch, where each top-level invocation is a single attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetryPolicy;

impl<E: Send + Sync> RetryPolicy<E> for NeverRetryPolicy {
    fn can_retry(&self, context: &RetryContext<E>) -> bool {
        context.retry_count() == 0
    }

    fn register_error(&self, context: &RetryContext<E>, error: &Arc<E>) {
        context.register_error(Some(Arc::clone(error)));
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(1)
    }
}

/// Always allows another attempt.
///
/// Intended to be composed with other exit signals: a timeout policy, a
/// listener veto, or the operation setting
/// [`set_exhausted_only`][RetryContext::set_exhausted_only]. On its own it
/// retries forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetryPolicy;

impl<E: Send + Sync> RetryPolicy<E> for AlwaysRetryPolicy {
    fn can_retry(&self, _context: &RetryContext<E>) -> bool {
        true
    }

    fn register_error(&self, context: &RetryContext<E>, error: &Arc<E>) {
        context.register_error(Some(Arc::clone(error)));
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::testing::StubError;

    assert_impl_all!(NeverRetryPolicy: Send, Sync, Clone);
    assert_impl_all!(AlwaysRetryPolicy: Send, Sync, Clone);

    #[test]
    fn never_allows_only_the_first_attempt() {
        let policy = NeverRetryPolicy;
        let context = RetryPolicy::<StubError>::open(&policy, None);

        assert!(policy.can_retry(&context));

        policy.register_error(&context, &Arc::new(StubError::transient()));

        assert!(!RetryPolicy::<StubError>::can_retry(&policy, &context));
        assert_eq!(context.retry_count(), 1);
        assert_eq!(RetryPolicy::<StubError>::max_attempts(&policy), Some(1));
    }

    #[test]
    fn always_keeps_allowing_attempts() {
        let policy = AlwaysRetryPolicy;
        let context = RetryPolicy::<StubError>::open(&policy, None);

        for _ in 0..10 {
            assert!(policy.can_retry(&context));
            policy.register_error(&context, &Arc::new(StubError::transient()));
        }

        assert!(RetryPolicy::<StubError>::can_retry(&policy, &context));
        assert_eq!(context.retry_count(), 10);
        assert_eq!(RetryPolicy::<StubError>::max_attempts(&policy), None);
    }
}
