// Copyright (c) Microsoft Corporation.

use std::error::Error as StdError;
use std::sync::Arc;

use super::RetryPolicy;
use crate::classify::BinaryErrorClassifier;
use crate::context::RetryContext;

/// Retries for as long as the last error classifies as retryable.
///
/// Classification only, no attempt count; compose with a
/// [`MaxAttemptsRetryPolicy`][super::MaxAttemptsRetryPolicy] inside a
/// [`CompositeRetryPolicy`][super::CompositeRetryPolicy] to bound it.
#[derive(Debug, Clone)]
pub struct ClassifierRetryPolicy<E> {
    classifier: BinaryErrorClassifier<E>,
}

impl<E> ClassifierRetryPolicy<E> {
    /// Creates a policy deciding retryability with `classifier`.
    #[must_use]
    pub fn new(classifier: BinaryErrorClassifier<E>) -> Self {
        Self { classifier }
    }
}

impl<E: StdError + Send + Sync + 'static> RetryPolicy<E> for ClassifierRetryPolicy<E> {
    fn can_retry(&self, context: &RetryContext<E>) -> bool {
        context
            .last_error()
            .map_or(true, |error| self.classifier.classify(&error))
    }

    fn register_error(&self, context: &RetryContext<E>, error: &Arc<E>) {
        context.register_error(Some(Arc::clone(error)));
    }
}
