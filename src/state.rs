// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::classify::BinaryErrorClassifier;

/// An equality-and-hash-stable identifier for a logical retryable operation.
///
/// Any `Eq + Hash + Debug` value can serve as a key. Keys are cheap to clone
/// and compare across types: keys built from different underlying types are
/// never equal.
///
/// # Examples
///
/// ```
/// use mulligan::RetryKey;
///
/// let a = RetryKey::new(("order", 42u64));
/// let b = RetryKey::new(("order", 42u64));
/// let c = RetryKey::new("order-42");
///
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// ```
#[derive(Clone)]
pub struct RetryKey(Arc<dyn DynKey>);

impl RetryKey {
    /// Wraps a value as a retry key.
    pub fn new<K>(key: K) -> Self
    where
        K: Hash + Eq + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(key))
    }

    /// Composes a key with a call-site label.
    ///
    /// Two call sites generating equal raw keys would collide in a shared
    /// context cache; prefixing the key with a distinct label keeps them
    /// apart.
    pub fn labeled(label: impl Into<Cow<'static, str>>, key: RetryKey) -> Self {
        Self::new((label.into(), key))
    }

    /// Borrows the underlying value, if it has type `K`.
    #[must_use]
    pub fn downcast_ref<K: 'static>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref::<K>()
    }
}

impl PartialEq for RetryKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for RetryKey {}

impl Hash for RetryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

impl fmt::Debug for RetryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.dyn_fmt(f)
    }
}

trait DynKey: Send + Sync {
    fn dyn_eq(&self, other: &dyn DynKey) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn dyn_fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
    fn as_any(&self) -> &dyn Any;
}

impl<K> DynKey for K
where
    K: Hash + Eq + fmt::Debug + Send + Sync + 'static,
{
    fn dyn_eq(&self, other: &dyn DynKey) -> bool {
        other.as_any().downcast_ref::<K>().is_some_and(|other| self == other)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        // The type is part of the identity, so equal-looking values of
        // different types hash apart.
        std::any::TypeId::of::<K>().hash(&mut state);
        self.hash(&mut state);
    }

    fn dyn_fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Caller-supplied descriptor for a stateful retry.
///
/// Supplying a `RetryState` to the engine switches it into stateful mode:
/// the retry context is cached under [`RetryState::key`] and resumed by
/// later invocations with an equal key, so one logical failure can be
/// retried across transactional boundaries.
///
/// The rollback decision controls what happens after a failed attempt:
/// rollback means the error is rethrown immediately (the caller's
/// surrounding transaction unwinds, and the next invocation resumes from the
/// cached context); otherwise the loop continues in-stack. By default every
/// error rolls back.
pub struct RetryState<E> {
    key: RetryKey,
    force_refresh: bool,
    rollback: Rollback<E>,
}

enum Rollback<E> {
    Always,
    Classifier(BinaryErrorClassifier<E>),
    Predicate(Arc<dyn Fn(&E) -> bool + Send + Sync>),
}

impl<E> RetryState<E> {
    /// Creates a stateful-retry descriptor for `key`.
    #[must_use]
    pub fn new(key: RetryKey) -> Self {
        Self {
            key,
            force_refresh: false,
            rollback: Rollback::Always,
        }
    }

    /// Skips the cache lookup and starts from a fresh context.
    ///
    /// Use when the caller knows the key has never been processed.
    #[must_use]
    pub fn force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    /// Classifies which errors roll the surrounding transaction back.
    ///
    /// Errors classified `true` are rethrown after registration; errors
    /// classified `false` keep the retry loop running in-stack.
    #[must_use]
    pub fn rollback_classifier(mut self, classifier: BinaryErrorClassifier<E>) -> Self {
        self.rollback = Rollback::Classifier(classifier);
        self
    }

    /// Decides rollback with a predicate instead of a classifier.
    #[must_use]
    pub fn rollback_when(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.rollback = Rollback::Predicate(Arc::new(predicate));
        self
    }

    /// The cache key identifying this logical operation.
    #[must_use]
    pub fn key(&self) -> &RetryKey {
        &self.key
    }

    /// Whether the cache lookup is skipped.
    #[must_use]
    pub fn is_force_refresh(&self) -> bool {
        self.force_refresh
    }
}

impl<E: StdError + 'static> RetryState<E> {
    /// Whether `error` should roll the caller's surrounding transaction
    /// back.
    #[must_use]
    pub fn rollback_for(&self, error: &E) -> bool {
        match &self.rollback {
            Rollback::Always => true,
            Rollback::Classifier(classifier) => classifier.classify(error),
            Rollback::Predicate(predicate) => predicate(error),
        }
    }
}

impl<E> fmt::Debug for RetryState<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[RetryState: key={:?}, force_refresh={}]", self.key, self.force_refresh)
    }
}
