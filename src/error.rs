// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::cache::CacheCapacityExceeded;
use crate::clock::SleepInterrupted;

/// An error returned by a retry execution.
///
/// The engine never swallows a failure: an operation error either continues
/// the loop (retryable), is propagated with its identity preserved
/// ([`RetryError::Error`]), or is wrapped by the exhaustion path
/// ([`RetryError::Exhausted`]). The remaining variants are raised by the
/// engine itself.
///
/// The operation's error is shared behind an [`Arc`] because the cached
/// retry context, the listeners, and this return value all refer to the same
/// failure.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation's own error, propagated raw.
    ///
    /// Produced when retries end without a recovery path in stateless mode,
    /// when a stateful invocation rolls back mid-loop, when a recovery
    /// callback itself fails, or on exhaustion with
    /// `throw_last_error_on_exhausted` set.
    Error(Arc<E>),

    /// Retries were exhausted with no recovery path, wrapping the last
    /// failure when one was recorded.
    ///
    /// Raised for stateful executions; an attempt bound of zero can exhaust
    /// a retry before any error was recorded, in which case the source is
    /// absent.
    Exhausted(Option<Arc<E>>),

    /// A listener's `open` hook vetoed the execution before the first
    /// attempt.
    Terminated,

    /// A backoff sleep was interrupted; the engine aborted all further
    /// attempts.
    Interrupted(SleepInterrupted),

    /// The context cache refused to store a context.
    CacheCapacity(CacheCapacityExceeded),

    /// The context cache and the retry state disagree, typically because the
    /// key's equality or hash is unstable.
    InconsistentCache(&'static str),
}

impl<E> RetryError<E> {
    /// The operation error this retry error carries, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Error(error) | Self::Exhausted(Some(error)) => Some(error),
            _ => None,
        }
    }

    /// Whether this is the exhaustion wrapper.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }
}

impl<E> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(_) => write!(f, "retry operation failed"),
            Self::Exhausted(_) => write!(f, "retry exhausted after last attempt with no recovery path"),
            Self::Terminated => write!(f, "retry terminated by listener before first attempt"),
            Self::Interrupted(_) => write!(f, "retry aborted: backoff interrupted"),
            Self::CacheCapacity(error) => fmt::Display::fmt(error, f),
            Self::InconsistentCache(detail) => write!(f, "inconsistent retry cache state: {detail}"),
        }
    }
}

impl<E: StdError + 'static> StdError for RetryError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Error(error) | Self::Exhausted(Some(error)) => Some(error.as_ref()),
            Self::Exhausted(None) | Self::Terminated | Self::InconsistentCache(_) => None,
            Self::Interrupted(interrupted) => Some(interrupted),
            Self::CacheCapacity(error) => Some(error),
        }
    }
}

pub(crate) const INCONSISTENT_NO_HISTORY: &str =
    "no history found for a cached key; the key's equality or hash may be unstable";

pub(crate) const INCONSISTENT_KEY_CHANGED: &str =
    "cache key changed between attempts; the key's equality or hash may be unstable";
