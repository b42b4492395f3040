// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;

use crate::context::RetryContext;

/// Hooks invoked synchronously around retry attempts, on the caller's
/// thread.
///
/// Listeners are registered on the engine builder. Within one execution,
/// [`open`][Self::open] runs once before the first attempt in registration
/// order; [`on_error`][Self::on_error] runs after each failed attempt and
/// before the backoff pause; [`on_success`][Self::on_success] runs after a
/// successful attempt; [`close`][Self::close] runs exactly once after the
/// loop exits, whatever the outcome. All hooks except `open` run in
/// *reverse* registration order, mirroring nested scopes.
///
/// The engine does not catch listener panics; listener authors own their
/// error discipline.
///
/// Every hook has a no-op default, so implementations override only what
/// they observe.
pub trait RetryListener<E>: Send + Sync {
    /// Called before the first attempt.
    ///
    /// Returning `false` from any listener aborts the execution with
    /// [`RetryError::Terminated`][crate::RetryError::Terminated] before the
    /// operation runs.
    fn open(&self, context: &RetryContext<E>) -> bool {
        let _ = context;
        true
    }

    /// Called after a successful attempt with the operation's result.
    ///
    /// The result type is specific to each `execute` call, so it is passed
    /// type-erased; downcast to the expected type to inspect it.
    fn on_success(&self, context: &RetryContext<E>, result: &dyn Any) {
        let _ = (context, result);
    }

    /// Called after each failed attempt, before the backoff pause.
    fn on_error(&self, context: &RetryContext<E>, error: &E) {
        let _ = (context, error);
    }

    /// Called once after the loop exits, with the last failure when the
    /// final attempt did not succeed.
    fn close(&self, context: &RetryContext<E>, last_error: Option<&E>) {
        let _ = (context, last_error);
    }
}
