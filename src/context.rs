// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::state::RetryKey;
use crate::ERR_POISONED_LOCK;

/// Well-known context attribute keys.
///
/// Retry policies, listeners, and the engine communicate through the
/// context's attribute bag; these constants name every reserved key so
/// external observers do not have to hard-code strings.
pub mod keys {
    /// An identifying label for the operation being retried.
    pub const NAME: &str = "context.name";

    /// The [`RetryKey`][crate::RetryKey] of a stateful retry.
    pub const STATE_KEY: &str = "context.state";

    /// Set to `true` once the context has been closed.
    pub const CLOSED: &str = "context.closed";

    /// Set to `true` when a recovery callback produced the result.
    pub const RECOVERED: &str = "context.recovered";

    /// Set to `true` once retries are exhausted.
    pub const EXHAUSTED: &str = "context.exhausted";

    /// Set to `true` when the last error must not be passed to a recovery
    /// callback.
    pub const NO_RECOVERY: &str = "context.no-recovery";

    /// The attempt bound reported by the retry policy, when it has one.
    pub const MAX_ATTEMPTS: &str = "context.max-attempts";

    /// Marks a context as global: it outlives individual executions and is
    /// kept in the context cache even on success. Used by the circuit
    /// breaker.
    pub const GLOBAL_STATE: &str = "state.global";

    /// Whether the circuit breaker guarding this context is currently open.
    pub const CIRCUIT_OPEN: &str = "circuit.open";

    /// Number of calls rejected while the circuit was open.
    pub const CIRCUIT_SHORT_COUNT: &str = "circuit.shortCount";

    /// The backoff policy's per-execution state.
    pub const BACKOFF_CONTEXT: &str = "backOffContext";

    /// The call arguments of a stateful invocation.
    pub const ARGS: &str = "ARGS";
}

/// A value stored in a retry context's attribute bag.
///
/// The bag is an open `string -> value` map; the reserved keys in [`keys`]
/// document which variant the engine stores under each of them. Arbitrary
/// state can be attached through [`AttrValue::Shared`].
#[derive(Clone)]
pub enum AttrValue {
    /// A boolean flag.
    Bool(bool),
    /// An unsigned integer.
    Int(u64),
    /// A string.
    Str(Cow<'static, str>),
    /// A point in time.
    Instant(Instant),
    /// A stateful-retry key.
    Key(RetryKey),
    /// Arbitrary shared state.
    Shared(Arc<dyn Any + Send + Sync>),
}

impl AttrValue {
    /// Returns the boolean value, if this is a [`AttrValue::Bool`].
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an [`AttrValue::Int`].
    #[must_use]
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the string value, if this is an [`AttrValue::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the instant, if this is an [`AttrValue::Instant`].
    #[must_use]
    pub fn as_instant(&self) -> Option<Instant> {
        match self {
            Self::Instant(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the retry key, if this is an [`AttrValue::Key`].
    #[must_use]
    pub fn as_key(&self) -> Option<&RetryKey> {
        match self {
            Self::Key(value) => Some(value),
            _ => None,
        }
    }

    /// Downcasts shared state to a concrete type.
    #[must_use]
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        match self {
            Self::Shared(value) => Arc::clone(value).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "Bool({value})"),
            Self::Int(value) => write!(f, "Int({value})"),
            Self::Str(value) => write!(f, "Str({value:?})"),
            Self::Instant(value) => write!(f, "Instant({value:?})"),
            Self::Key(value) => write!(f, "Key({value:?})"),
            Self::Shared(_) => write!(f, "Shared(..)"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u32> for AttrValue {
    fn from(value: u32) -> Self {
        Self::Int(u64::from(value))
    }
}

impl From<u64> for AttrValue {
    fn from(value: u64) -> Self {
        Self::Int(value)
    }
}

impl From<&'static str> for AttrValue {
    fn from(value: &'static str) -> Self {
        Self::Str(Cow::Borrowed(value))
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(Cow::Owned(value))
    }
}

impl From<Instant> for AttrValue {
    fn from(value: Instant) -> Self {
        Self::Instant(value)
    }
}

impl From<RetryKey> for AttrValue {
    fn from(value: RetryKey) -> Self {
        Self::Key(value)
    }
}

/// Per-operation retry state.
///
/// A context is created by a retry policy's `open`, carried through every
/// attempt of one execution, and closed when the execution ends. In stateful
/// mode the same context is cached by key and resumed across separate
/// top-level invocations.
///
/// The retry count is monotonically non-decreasing and equals the number of
/// registered failures. Counters and the last error have publication
/// semantics: a listener observing the context after an attempt sees the
/// final values.
pub struct RetryContext<E> {
    parent: Option<Arc<RetryContext<E>>>,
    count: AtomicU32,
    last_error: Mutex<Option<Arc<E>>>,
    exhausted_only: AtomicBool,
    attributes: Mutex<HashMap<Cow<'static, str>, AttrValue>>,
}

impl<E> RetryContext<E> {
    /// Creates a context, optionally nested under an enclosing one.
    #[must_use]
    pub fn new(parent: Option<Arc<RetryContext<E>>>) -> Self {
        Self {
            parent,
            count: AtomicU32::new(0),
            last_error: Mutex::new(None),
            exhausted_only: AtomicBool::new(false),
            attributes: Mutex::new(HashMap::new()),
        }
    }

    /// The enclosing context, when this execution is nested inside another
    /// retry.
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<RetryContext<E>>> {
        self.parent.as_ref()
    }

    /// Number of failures registered so far. Starts at zero.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// The most recent failure, if any attempt has failed.
    #[must_use]
    pub fn last_error(&self) -> Option<Arc<E>> {
        self.last_error.lock().expect(ERR_POISONED_LOCK).clone()
    }

    /// Signals the engine to stop after the current attempt.
    ///
    /// The operation itself may call this to end the loop regardless of what
    /// the retry policy would decide.
    pub fn set_exhausted_only(&self) {
        self.exhausted_only.store(true, Ordering::Release);
    }

    /// Whether the loop was asked to stop after the current attempt.
    #[must_use]
    pub fn is_exhausted_only(&self) -> bool {
        self.exhausted_only.load(Ordering::Acquire)
    }

    /// Records a failure, incrementing the retry count when `error` is
    /// present.
    ///
    /// Service-provider contract: retry policies call this exactly once per
    /// failed attempt from their `register_error`.
    pub fn register_error(&self, error: Option<Arc<E>>) {
        let mut last = self.last_error.lock().expect(ERR_POISONED_LOCK);
        if error.is_some() {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        *last = error;
    }

    // The circuit breaker proxies the count and last error of its delegate
    // context so external observers see the delegate's progress.
    pub(crate) fn mirror(&self, count: u32, last_error: Option<Arc<E>>) {
        let mut last = self.last_error.lock().expect(ERR_POISONED_LOCK);
        self.count.store(count, Ordering::Release);
        *last = last_error;
    }

    /// Returns the attribute stored under `key`.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<AttrValue> {
        self.attributes.lock().expect(ERR_POISONED_LOCK).get(key).cloned()
    }

    /// Stores an attribute under `key`, replacing any previous value.
    pub fn set_attribute(&self, key: impl Into<Cow<'static, str>>, value: impl Into<AttrValue>) {
        self.attributes
            .lock()
            .expect(ERR_POISONED_LOCK)
            .insert(key.into(), value.into());
    }

    /// Removes and returns the attribute stored under `key`.
    pub fn remove_attribute(&self, key: &str) -> Option<AttrValue> {
        self.attributes.lock().expect(ERR_POISONED_LOCK).remove(key)
    }

    /// Whether an attribute is stored under `key`.
    #[must_use]
    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.lock().expect(ERR_POISONED_LOCK).contains_key(key)
    }

    /// Whether the attribute under `key` is the boolean `true`.
    #[must_use]
    pub fn attribute_flag(&self, key: &str) -> bool {
        matches!(self.attribute(key), Some(AttrValue::Bool(true)))
    }
}

impl<E: fmt::Debug> fmt::Debug for RetryContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[RetryContext: count={}, last_error={:?}, exhausted_only={}]",
            self.retry_count(),
            self.last_error.lock().expect(ERR_POISONED_LOCK),
            self.is_exhausted_only(),
        )
    }
}
