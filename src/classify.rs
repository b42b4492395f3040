// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::TypeId;
use std::error::Error as StdError;
use std::fmt;
use std::marker::PhantomData;

/// Classifies errors as `true` or `false` by registered type.
///
/// The classifier holds a set of `(error type, value)` rules plus a default.
/// Classification probes the concrete type of the error and, when
/// [`traverse_causes`][Self::traverse_causes] is enabled, of every error in
/// its `source()` chain until a registered type matches; the first match
/// wins, otherwise the default applies.
///
/// The retry engine uses binary classifiers for three independent decisions:
/// whether an error is retryable, whether it may be handed to a recovery
/// callback, and whether a stateful invocation rolls back.
///
/// # Examples
///
/// ```
/// use mulligan::BinaryErrorClassifier;
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("connection reset")]
/// struct ConnectionReset;
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("bad request")]
/// struct BadRequest;
///
/// #[derive(Debug, thiserror::Error)]
/// enum ApiError {
///     #[error("connection reset")]
///     ConnectionReset(#[source] ConnectionReset),
///     #[error("bad request")]
///     BadRequest(#[source] BadRequest),
/// }
///
/// let classifier = BinaryErrorClassifier::new(false)
///     .with_type::<ConnectionReset>(true)
///     .traverse_causes(true);
///
/// assert!(classifier.classify(&ApiError::ConnectionReset(ConnectionReset)));
/// assert!(!classifier.classify(&ApiError::BadRequest(BadRequest)));
/// ```
pub struct BinaryErrorClassifier<E> {
    default_value: bool,
    traverse_causes: bool,
    rules: Vec<Rule>,
    _marker: PhantomData<fn(&E)>,
}

#[derive(Clone, Copy)]
struct Rule {
    type_id: TypeId,
    value: bool,
    probe: fn(&(dyn StdError + 'static)) -> bool,
}

fn probe_is<T: StdError + 'static>(error: &(dyn StdError + 'static)) -> bool {
    error.is::<T>()
}

impl<E> BinaryErrorClassifier<E> {
    /// Creates a classifier with no rules that returns `default_value` for
    /// every error.
    #[must_use]
    pub fn new(default_value: bool) -> Self {
        Self {
            default_value,
            traverse_causes: false,
            rules: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Enables or disables matching against the error's cause chain.
    ///
    /// When disabled (the default), only the outermost error is probed.
    #[must_use]
    pub fn traverse_causes(mut self, enabled: bool) -> Self {
        self.traverse_causes = enabled;
        self
    }

    /// Registers `value` for errors of type `T`, replacing any previous rule
    /// for the same type.
    #[must_use]
    pub fn with_type<T: StdError + 'static>(mut self, value: bool) -> Self {
        let rule = Rule {
            type_id: TypeId::of::<T>(),
            value,
            probe: probe_is::<T>,
        };
        if let Some(existing) = self.rules.iter_mut().find(|r| r.type_id == rule.type_id) {
            *existing = rule;
        } else {
            self.rules.push(rule);
        }
        self
    }

    /// Replaces the value returned when no registered type matches.
    #[must_use]
    pub fn with_default_value(mut self, default_value: bool) -> Self {
        self.default_value = default_value;
        self
    }

    /// The value returned when no registered type matches.
    #[must_use]
    pub fn default_value(&self) -> bool {
        self.default_value
    }
}

impl<E: StdError + 'static> BinaryErrorClassifier<E> {
    /// Classifies `error` against the registered type rules.
    #[must_use]
    pub fn classify(&self, error: &E) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(error);
        while let Some(err) = current {
            for rule in &self.rules {
                if (rule.probe)(err) {
                    return rule.value;
                }
            }
            if !self.traverse_causes {
                break;
            }
            current = err.source();
        }
        self.default_value
    }
}

impl<E> Clone for BinaryErrorClassifier<E> {
    fn clone(&self) -> Self {
        Self {
            default_value: self.default_value,
            traverse_causes: self.traverse_causes,
            rules: self.rules.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E> Default for BinaryErrorClassifier<E> {
    /// A classifier that classifies every error as `false`.
    fn default() -> Self {
        Self::new(false)
    }
}

impl<E> fmt::Debug for BinaryErrorClassifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryErrorClassifier")
            .field("default_value", &self.default_value)
            .field("traverse_causes", &self.traverse_causes)
            .field("rules", &self.rules.len())
            .finish()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::testing::{StubError, StubKind};

    assert_impl_all!(BinaryErrorClassifier<StubError>: Send, Sync, Clone);

    #[derive(Debug, PartialEq)]
    struct Outer(StubError);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "outer")
        }
    }

    impl StdError for Outer {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn unregistered_error_gets_default() {
        let truthy = BinaryErrorClassifier::<StubError>::new(true);
        let falsy = BinaryErrorClassifier::<StubError>::new(false);

        assert!(truthy.classify(&StubError::transient()));
        assert!(!falsy.classify(&StubError::transient()));
    }

    #[test]
    fn registered_type_wins_over_default() {
        let classifier = BinaryErrorClassifier::<StubError>::new(false).with_type::<StubError>(true);
        assert!(classifier.classify(&StubError::transient()));
    }

    #[test]
    fn with_type_replaces_existing_rule() {
        let classifier = BinaryErrorClassifier::<StubError>::new(false)
            .with_type::<StubError>(true)
            .with_type::<StubError>(false);

        assert!(!classifier.classify(&StubError::transient()));
    }

    #[test]
    fn cause_chain_is_ignored_without_traversal() {
        let classifier = BinaryErrorClassifier::<Outer>::new(false).with_type::<StubError>(true);

        assert!(!classifier.classify(&Outer(StubError::transient())));
    }

    #[test]
    fn cause_chain_matches_with_traversal() {
        let classifier = BinaryErrorClassifier::<Outer>::new(false)
            .with_type::<StubError>(true)
            .traverse_causes(true);

        assert!(classifier.classify(&Outer(StubError::transient())));
    }

    #[test]
    fn outermost_rule_beats_cause_rule() {
        let classifier = BinaryErrorClassifier::<Outer>::new(true)
            .with_type::<Outer>(false)
            .with_type::<StubError>(true)
            .traverse_causes(true);

        assert!(!classifier.classify(&Outer(StubError::transient())));
    }

    #[test]
    fn kind_is_not_part_of_the_match() {
        // Rules match on the Rust type, not the value inside it.
        let classifier = BinaryErrorClassifier::<StubError>::new(false).with_type::<StubError>(true);

        assert!(classifier.classify(&StubError::new(StubKind::Transient)));
        assert!(classifier.classify(&StubError::new(StubKind::Fatal)));
    }
}
