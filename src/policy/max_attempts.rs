// Copyright (c) Microsoft Corporation.

use std::sync::Arc;

use super::RetryPolicy;
use crate::context::RetryContext;
use crate::supplier::Supplier;

/// Retries on any error until a fixed number of attempts is consumed.
///
/// Count only, no classification; compose with a
/// [`ClassifierRetryPolicy`][super::ClassifierRetryPolicy] inside a
/// [`CompositeRetryPolicy`][super::CompositeRetryPolicy] to add it. The
/// bound includes the initial attempt.
#[derive(Debug, Clone)]
pub struct MaxAttemptsRetryPolicy {
    max_attempts: Supplier<u32>,
}

impl MaxAttemptsRetryPolicy {
    /// Creates a policy allowing `max_attempts` attempts in total.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: Supplier::Fixed(max_attempts),
        }
    }

    /// Re-evaluates the attempt bound on every check.
    #[must_use]
    pub fn with_supplier(supplier: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        Self {
            max_attempts: Supplier::dynamic(supplier),
        }
    }
}

impl Default for MaxAttemptsRetryPolicy {
    fn default() -> Self {
        Self::new(super::simple::DEFAULT_MAX_ATTEMPTS)
    }
}

impl<E: Send + Sync> RetryPolicy<E> for MaxAttemptsRetryPolicy {
    fn can_retry(&self, context: &RetryContext<E>) -> bool {
        context.retry_count() < self.max_attempts.get()
    }

    fn register_error(&self, context: &RetryContext<E>, error: &Arc<E>) {
        context.register_error(Some(Arc::clone(error)));
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts.get())
    }
}
