// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use super::RetryPolicy;
use crate::context::{AttrValue, RetryContext};

const CHILD_CONTEXTS: &str = "composite.contexts";

/// Combines the verdicts of several retry policies.
///
/// In the default pessimistic mode every child policy must allow the next
/// attempt (AND); in [`optimistic`][Self::optimistic] mode one consenting
/// child suffices (OR). Each child owns its own context, opened alongside
/// the composite's and addressed by position, so per-child state (counts,
/// time windows) evolves independently.
///
/// # Examples
///
/// ```
/// use mulligan::policy::{CompositeRetryPolicy, MaxAttemptsRetryPolicy, TimeoutRetryPolicy};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("boom")]
/// struct Boom;
///
/// // Retry while attempts remain AND the time budget holds.
/// let policy: CompositeRetryPolicy<Boom> = CompositeRetryPolicy::new()
///     .policy(MaxAttemptsRetryPolicy::new(5))
///     .policy(TimeoutRetryPolicy::default());
/// ```
pub struct CompositeRetryPolicy<E> {
    policies: Vec<Arc<dyn RetryPolicy<E>>>,
    optimistic: bool,
}

impl<E> CompositeRetryPolicy<E> {
    /// Creates an empty pessimistic (AND) composite.
    #[must_use]
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
            optimistic: false,
        }
    }

    /// Adds a child policy.
    #[must_use]
    pub fn policy(mut self, policy: impl RetryPolicy<E> + 'static) -> Self {
        self.policies.push(Arc::new(policy));
        self
    }

    /// Switches to optimistic (OR) combination: any child allowing the next
    /// attempt keeps the loop running.
    #[must_use]
    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    fn children(context: &RetryContext<E>) -> Arc<Vec<Arc<RetryContext<E>>>>
    where
        E: Send + Sync + 'static,
    {
        context
            .attribute(CHILD_CONTEXTS)
            .and_then(|value| value.downcast::<Vec<Arc<RetryContext<E>>>>())
            .expect("composite context is missing its child contexts")
    }
}

impl<E> Default for CompositeRetryPolicy<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + Sync + 'static> RetryPolicy<E> for CompositeRetryPolicy<E> {
    fn open(&self, parent: Option<Arc<RetryContext<E>>>) -> Arc<RetryContext<E>> {
        let children: Vec<_> = self.policies.iter().map(|policy| policy.open(parent.clone())).collect();

        let context = Arc::new(RetryContext::new(parent));
        context.set_attribute(CHILD_CONTEXTS, AttrValue::Shared(Arc::new(children)));
        context
    }

    fn can_retry(&self, context: &RetryContext<E>) -> bool {
        let children = Self::children(context);
        let mut verdicts = self.policies.iter().zip(children.iter()).map(|(p, c)| p.can_retry(c));

        if self.optimistic {
            verdicts.any(|allowed| allowed)
        } else {
            verdicts.all(|allowed| allowed)
        }
    }

    fn register_error(&self, context: &RetryContext<E>, error: &Arc<E>) {
        let children = Self::children(context);
        for (policy, child) in self.policies.iter().zip(children.iter()) {
            policy.register_error(child, error);
        }
        context.register_error(Some(Arc::clone(error)));
    }

    fn close(&self, context: &RetryContext<E>) {
        let children = Self::children(context);
        for (policy, child) in self.policies.iter().zip(children.iter()) {
            policy.close(child);
        }
    }
}

impl<E> fmt::Debug for CompositeRetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CompositeRetryPolicy[policies={}, optimistic={}]",
            self.policies.len(),
            self.optimistic
        )
    }
}
