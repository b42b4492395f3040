// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use super::RetryPolicy;
use crate::classify::BinaryErrorClassifier;
use crate::context::{keys, RetryContext};
use crate::supplier::Supplier;

/// The default attempt bound, counting the initial attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Retries a classified set of errors a fixed number of times.
///
/// The attempt bound includes the initial attempt: a bound of 3 means the
/// operation runs at most three times. The retryable classifier defaults to
/// retrying every error; a second, independent classifier can mark selected
/// errors as not recoverable, which makes the engine bypass any recovery
/// callback and rethrow them on exhaustion.
///
/// This is the engine's default policy.
///
/// # Examples
///
/// ```
/// use mulligan::policy::SimpleRetryPolicy;
/// use mulligan::BinaryErrorClassifier;
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("timeout")]
/// struct Timeout;
///
/// let policy: SimpleRetryPolicy<Timeout> =
///     SimpleRetryPolicy::new(5).classifier(BinaryErrorClassifier::new(false).with_type::<Timeout>(true));
/// ```
pub struct SimpleRetryPolicy<E> {
    max_attempts: Supplier<u32>,
    retryable: BinaryErrorClassifier<E>,
    recoverable: BinaryErrorClassifier<E>,
}

impl<E> SimpleRetryPolicy<E> {
    /// Creates a policy retrying every error at most `max_attempts` times in
    /// total.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: Supplier::Fixed(max_attempts),
            retryable: BinaryErrorClassifier::new(true),
            recoverable: BinaryErrorClassifier::new(true).traverse_causes(true),
        }
    }

    /// Replaces the retryable classifier.
    #[must_use]
    pub fn classifier(mut self, classifier: BinaryErrorClassifier<E>) -> Self {
        self.retryable = classifier;
        self
    }

    /// Replaces the not-recoverable classifier.
    ///
    /// Errors this classifier maps to `false` are never handed to a
    /// recovery callback; the engine rethrows them raw on exhaustion.
    #[must_use]
    pub fn recoverable_classifier(mut self, classifier: BinaryErrorClassifier<E>) -> Self {
        self.recoverable = classifier;
        self
    }

    /// Marks errors of type `T` as not recoverable.
    #[must_use]
    pub fn not_recoverable<T: StdError + 'static>(mut self) -> Self {
        self.recoverable = self.recoverable.with_type::<T>(false);
        self
    }

    /// Re-evaluates the attempt bound on every check.
    ///
    /// Lets the bound change between attempts without rebuilding the
    /// policy.
    #[must_use]
    pub fn max_attempts_supplier(mut self, supplier: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        self.max_attempts = Supplier::dynamic(supplier);
        self
    }
}

impl<E> Default for SimpleRetryPolicy<E> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl<E: StdError + Send + Sync + 'static> RetryPolicy<E> for SimpleRetryPolicy<E> {
    fn can_retry(&self, context: &RetryContext<E>) -> bool {
        let last = context.last_error();
        let can = last.as_ref().map_or(true, |error| self.retryable.classify(error))
            && context.retry_count() < self.max_attempts.get();

        // A rejected error that is also not recoverable must bypass any
        // recovery callback; the engine reads the flag on exhaustion.
        match last {
            Some(error) if !can && !self.recoverable.classify(&error) => {
                context.set_attribute(keys::NO_RECOVERY, true);
            }
            _ => {
                context.remove_attribute(keys::NO_RECOVERY);
            }
        }

        can
    }

    fn register_error(&self, context: &RetryContext<E>, error: &Arc<E>) {
        context.register_error(Some(Arc::clone(error)));
    }

    fn max_attempts(&self) -> Option<u32> {
        Some(self.max_attempts.get())
    }
}

impl<E> fmt::Debug for SimpleRetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimpleRetryPolicy[max_attempts={:?}]", self.max_attempts)
    }
}
