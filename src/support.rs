// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process-wide registry of the retry context active on the current thread.
//!
//! The engine registers the context when an execution starts and clears it
//! when the execution ends, restoring the parent context for nested retries.
//! Code running inside the operation, a listener, or a recovery callback can
//! read the active context with [`current_context`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};

use crate::context::RetryContext;
use crate::ERR_POISONED_LOCK;

static USE_THREAD_LOCAL: AtomicBool = AtomicBool::new(true);

thread_local! {
    static CONTEXT: RefCell<Option<Arc<dyn Any + Send + Sync>>> = const { RefCell::new(None) };
}

static CONTEXTS: OnceLock<Mutex<HashMap<ThreadId, Arc<dyn Any + Send + Sync>>>> = OnceLock::new();

fn contexts() -> &'static Mutex<HashMap<ThreadId, Arc<dyn Any + Send + Sync>>> {
    CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Chooses the storage backing the registry.
///
/// With `true` (the default) contexts live in a true thread-local. With
/// `false` they live in a thread-keyed map, which suits environments with
/// very large numbers of short-lived threads where thread-local storage is
/// undesirable.
///
/// This is a process-wide switch; flip it once at startup, before any
/// execution runs.
pub fn set_use_thread_local(enabled: bool) {
    USE_THREAD_LOCAL.store(enabled, Ordering::Release);
}

fn thread_local_enabled() -> bool {
    USE_THREAD_LOCAL.load(Ordering::Acquire)
}

/// The retry context of the execution currently running on this thread, if
/// any.
///
/// Returns `None` outside of an execution, or when the active execution uses
/// a different error type than `E`.
#[must_use]
pub fn current_context<E: Send + Sync + 'static>() -> Option<Arc<RetryContext<E>>> {
    let stored = if thread_local_enabled() {
        CONTEXT.with(|context| context.borrow().clone())
    } else {
        contexts()
            .lock()
            .expect(ERR_POISONED_LOCK)
            .get(&thread::current().id())
            .cloned()
    };

    stored.and_then(|any| any.downcast::<RetryContext<E>>().ok())
}

fn store(context: Option<Arc<dyn Any + Send + Sync>>) {
    if thread_local_enabled() {
        CONTEXT.with(|slot| *slot.borrow_mut() = context);
    } else {
        let mut map = contexts().lock().expect(ERR_POISONED_LOCK);
        match context {
            Some(context) => {
                map.insert(thread::current().id(), context);
            }
            None => {
                map.remove(&thread::current().id());
            }
        }
    }
}

/// Publishes `context` as this thread's active context.
pub(crate) fn register<E: Send + Sync + 'static>(context: Arc<RetryContext<E>>) {
    store(Some(context));
}

/// Removes this thread's active context, restoring its parent when the
/// execution was nested.
pub(crate) fn clear<E: Send + Sync + 'static>() {
    let parent = current_context::<E>().and_then(|context| context.parent().cloned());
    store(parent.map(|parent| parent as Arc<dyn Any + Send + Sync>));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubError;

    #[test]
    fn no_context_outside_an_execution() {
        assert!(current_context::<StubError>().is_none());
    }

    #[test]
    fn register_then_clear_round_trip() {
        let context = Arc::new(RetryContext::<StubError>::new(None));
        register(Arc::clone(&context));

        let seen = current_context::<StubError>().unwrap();
        assert!(Arc::ptr_eq(&seen, &context));

        clear::<StubError>();
        assert!(current_context::<StubError>().is_none());
    }

    #[test]
    fn clear_restores_the_parent() {
        let parent = Arc::new(RetryContext::<StubError>::new(None));
        let child = Arc::new(RetryContext::new(Some(Arc::clone(&parent))));

        register(Arc::clone(&parent));
        register(Arc::clone(&child));

        clear::<StubError>();
        let seen = current_context::<StubError>().unwrap();
        assert!(Arc::ptr_eq(&seen, &parent));

        clear::<StubError>();
        assert!(current_context::<StubError>().is_none());
    }

    #[test]
    fn contexts_are_per_thread() {
        let context = Arc::new(RetryContext::<StubError>::new(None));
        register(Arc::clone(&context));

        let other = thread::spawn(|| current_context::<StubError>().is_none()).join().unwrap();
        assert!(other);

        clear::<StubError>();
    }
}
