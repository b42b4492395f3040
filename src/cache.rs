// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::context::RetryContext;
use crate::state::RetryKey;
use crate::ERR_POISONED_LOCK;

/// The default bound on cached retry contexts.
pub const DEFAULT_CAPACITY: usize = 4096;

/// A store of retry contexts keyed by [`RetryKey`], shared across stateful
/// invocations.
///
/// The cache is the only synchronization surface between concurrent
/// executions sharing retry state: all four operations are atomic.
/// Implementations must be safe for concurrent readers and writers.
pub trait RetryContextCache<E>: Send + Sync {
    /// Returns the context cached under `key`, if any.
    fn get(&self, key: &RetryKey) -> Option<Arc<RetryContext<E>>>;

    /// Caches `context` under `key`, replacing any previous entry.
    ///
    /// May refuse with [`CacheCapacityExceeded`] when a bound would be
    /// crossed; enforcement is best-effort under race.
    fn put(&self, key: RetryKey, context: Arc<RetryContext<E>>) -> Result<(), CacheCapacityExceeded>;

    /// Removes the entry under `key`, if present.
    fn remove(&self, key: &RetryKey);

    /// Whether an entry exists under `key`.
    fn contains_key(&self, key: &RetryKey) -> bool;
}

// Lets a caller keep a handle on the cache it hands to the engine builder.
impl<E, C: RetryContextCache<E> + ?Sized> RetryContextCache<E> for Arc<C> {
    fn get(&self, key: &RetryKey) -> Option<Arc<RetryContext<E>>> {
        (**self).get(key)
    }

    fn put(&self, key: RetryKey, context: Arc<RetryContext<E>>) -> Result<(), CacheCapacityExceeded> {
        (**self).put(key, context)
    }

    fn remove(&self, key: &RetryKey) {
        (**self).remove(key);
    }

    fn contains_key(&self, key: &RetryKey) -> bool {
        (**self).contains_key(key)
    }
}

/// A put was refused because the cache already holds its configured maximum
/// number of contexts.
///
/// Usually a sign that retry keys are not being removed, for example because
/// a key generator produces unstable keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("retry context cache capacity of {capacity} exceeded")]
pub struct CacheCapacityExceeded {
    capacity: usize,
}

impl CacheCapacityExceeded {
    /// The capacity that was exceeded.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// The default in-memory bounded cache.
///
/// Exceeding the capacity (default [`DEFAULT_CAPACITY`]) makes
/// [`put`][RetryContextCache::put] fail rather than evicting, because
/// silently dropping a context would lose a logical operation's retry
/// history.
pub struct MapRetryContextCache<E> {
    map: Mutex<HashMap<RetryKey, Arc<RetryContext<E>>>>,
    capacity: usize,
}

impl<E> MapRetryContextCache<E> {
    /// Creates a cache bounded at [`DEFAULT_CAPACITY`] contexts.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a cache bounded at `capacity` contexts.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Number of cached contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().expect(ERR_POISONED_LOCK).len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for MapRetryContextCache<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + Sync> RetryContextCache<E> for MapRetryContextCache<E> {
    fn get(&self, key: &RetryKey) -> Option<Arc<RetryContext<E>>> {
        self.map.lock().expect(ERR_POISONED_LOCK).get(key).cloned()
    }

    fn put(&self, key: RetryKey, context: Arc<RetryContext<E>>) -> Result<(), CacheCapacityExceeded> {
        let mut map = self.map.lock().expect(ERR_POISONED_LOCK);
        if !map.contains_key(&key) && map.len() >= self.capacity {
            return Err(CacheCapacityExceeded {
                capacity: self.capacity,
            });
        }
        map.insert(key, context);
        Ok(())
    }

    fn remove(&self, key: &RetryKey) {
        self.map.lock().expect(ERR_POISONED_LOCK).remove(key);
    }

    fn contains_key(&self, key: &RetryKey) -> bool {
        self.map.lock().expect(ERR_POISONED_LOCK).contains_key(key)
    }
}

impl<E> fmt::Debug for MapRetryContextCache<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapRetryContextCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
