// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::classify::BinaryErrorClassifier;
use crate::context::{keys, AttrValue, RetryContext};
use crate::engine::Retry;
use crate::error::RetryError;
use crate::state::{RetryKey, RetryState};

/// Dispatches repeated invocations of an external operation through stateful
/// retry.
///
/// Each invocation carries arguments `A`; a key generator derives the
/// [`RetryKey`] identifying the logical work item from them, so a failed
/// item is tracked across invocations until its retries are exhausted, at
/// which point the recovery handler (if any) is invoked with the arguments
/// and the last failure.
///
/// By default every failure rolls back: the error is rethrown so the
/// caller's surrounding transaction can unwind, and the next invocation with
/// an equal key resumes the cached context. A
/// [`rollback_classifier`][Self::rollback_classifier] can downgrade selected
/// errors to in-stack retry.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use mulligan::policy::NeverRetryPolicy;
/// use mulligan::{Retry, RetryKey, StatefulRetry};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("delivery failed")]
/// struct DeliveryFailed;
///
/// let retry = Retry::<DeliveryFailed>::builder()
///     .retry_policy(NeverRetryPolicy)
///     .build();
///
/// let dispatch = StatefulRetry::new(retry, |order_id: &u64| Some(RetryKey::new(*order_id)));
///
/// let result = dispatch.invoke(Arc::new(42u64), |order_id| {
///     // deliver the order...
///     Ok::<_, DeliveryFailed>(*order_id)
/// });
/// assert_eq!(result.unwrap(), 42);
/// ```
pub struct StatefulRetry<A, E> {
    retry: Retry<E>,
    key_generator: Arc<dyn Fn(&A) -> Option<RetryKey> + Send + Sync>,
    new_args_identifier: Option<Arc<dyn Fn(&A) -> bool + Send + Sync>>,
    rollback: Option<BinaryErrorClassifier<E>>,
    label: Cow<'static, str>,
    use_raw_key: bool,
}

const DEFAULT_LABEL: &str = "stateful-retry";

impl<A, E> StatefulRetry<A, E>
where
    A: Send + Sync + 'static,
    E: StdError + Send + Sync + 'static,
{
    /// Creates a dispatcher over `retry`, identifying work items with
    /// `key_generator`.
    ///
    /// Returning `None` from the generator disables retry for that
    /// invocation: the operation runs exactly once.
    pub fn new(retry: Retry<E>, key_generator: impl Fn(&A) -> Option<RetryKey> + Send + Sync + 'static) -> Self {
        Self {
            retry,
            key_generator: Arc::new(key_generator),
            new_args_identifier: None,
            rollback: None,
            label: Cow::Borrowed(DEFAULT_LABEL),
            use_raw_key: false,
        }
    }

    /// Labels this dispatcher's keys.
    ///
    /// Unless [`use_raw_key`][Self::use_raw_key] is set, generated keys are
    /// composed with the label so distinct call sites sharing a cache never
    /// collide.
    #[must_use]
    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = label.into();
        self
    }

    /// Uses the generator's keys verbatim, without label composition.
    ///
    /// Only safe when keys are globally unique across call sites.
    #[must_use]
    pub fn use_raw_key(mut self, use_raw_key: bool) -> Self {
        self.use_raw_key = use_raw_key;
        self
    }

    /// Detects never-before-seen arguments.
    ///
    /// When the identifier reports `true`, the cached context for the key is
    /// ignored and retry state starts fresh.
    #[must_use]
    pub fn new_args_identifier(mut self, identifier: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        self.new_args_identifier = Some(Arc::new(identifier));
        self
    }

    /// Downgrades selected errors from rollback to in-stack retry.
    ///
    /// Errors the classifier maps to `false` keep the loop running inside
    /// the current invocation instead of rethrowing.
    #[must_use]
    pub fn rollback_classifier(mut self, classifier: BinaryErrorClassifier<E>) -> Self {
        self.rollback = Some(classifier);
        self
    }

    /// Invokes `op` for `args` under stateful retry.
    pub fn invoke<T, F>(&self, args: Arc<A>, op: F) -> Result<T, RetryError<E>>
    where
        T: 'static,
        F: FnMut(&A) -> Result<T, E>,
    {
        self.do_invoke(args, op, None::<fn(&A, Option<&E>) -> Result<T, E>>)
    }

    /// Invokes `op` for `args` under stateful retry, recovering with
    /// `recovery` once the item's retries are exhausted.
    ///
    /// The recovery handler receives the invocation arguments and the last
    /// failure (absent only when the retry exhausted before any attempt
    /// ran).
    pub fn invoke_with_recovery<T, F, R>(&self, args: Arc<A>, op: F, recovery: R) -> Result<T, RetryError<E>>
    where
        T: 'static,
        F: FnMut(&A) -> Result<T, E>,
        R: FnOnce(&A, Option<&E>) -> Result<T, E>,
    {
        self.do_invoke(args, op, Some(recovery))
    }

    fn do_invoke<T, F, R>(&self, args: Arc<A>, mut op: F, recovery: Option<R>) -> Result<T, RetryError<E>>
    where
        T: 'static,
        F: FnMut(&A) -> Result<T, E>,
        R: FnOnce(&A, Option<&E>) -> Result<T, E>,
    {
        let Some(raw_key) = (self.key_generator)(&args) else {
            // No key means the caller opted this invocation out of retry.
            debug!("no key generated for arguments, invoking once without retry");
            return op(&args).map_err(|error| RetryError::Error(Arc::new(error)));
        };

        let key = if self.use_raw_key {
            raw_key
        } else {
            RetryKey::labeled(self.label.clone(), raw_key)
        };

        let force_refresh = self.new_args_identifier.as_ref().is_some_and(|is_new| is_new(&args));

        let mut state = RetryState::new(key).force_refresh(force_refresh);
        if let Some(classifier) = &self.rollback {
            state = state.rollback_classifier(classifier.clone());
        }

        let op_args = Arc::clone(&args);
        let wrapped_op = move |context: &RetryContext<E>| {
            context.set_attribute(keys::ARGS, AttrValue::Shared(Arc::clone(&op_args) as _));
            op(&op_args)
        };

        match recovery {
            Some(recovery) => {
                let recovery_args = Arc::clone(&args);
                self.retry.execute_stateful_with_recovery(
                    wrapped_op,
                    move |context: &RetryContext<E>| {
                        let last = context.last_error();
                        recovery(&recovery_args, last.as_deref())
                    },
                    &state,
                )
            }
            None => self.retry.execute_stateful(wrapped_op, &state),
        }
    }
}

impl<A, E> fmt::Debug for StatefulRetry<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulRetry")
            .field("label", &self.label)
            .field("use_raw_key", &self.use_raw_key)
            .finish_non_exhaustive()
    }
}
