// Copyright (c) Microsoft Corporation.

use std::fmt;
use std::sync::Arc;

/// A configuration value that is either fixed or re-evaluated on every read.
///
/// Policies accept suppliers for their tunable parameters so values may
/// change between attempts without affecting in-flight state that has
/// already captured them.
pub(crate) enum Supplier<T> {
    Fixed(T),
    Dynamic(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> Supplier<T> {
    pub fn get(&self) -> T {
        match self {
            Self::Fixed(value) => value.clone(),
            Self::Dynamic(supplier) => supplier(),
        }
    }
}

impl<T> Supplier<T> {
    pub fn dynamic(supplier: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::Dynamic(Arc::new(supplier))
    }
}

impl<T: Clone> Clone for Supplier<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Fixed(value) => Self::Fixed(value.clone()),
            Self::Dynamic(supplier) => Self::Dynamic(Arc::clone(supplier)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Supplier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => write!(f, "Fixed({value:?})"),
            Self::Dynamic(_) => write!(f, "Dynamic(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn fixed_value_is_stable() {
        let supplier = Supplier::Fixed(7u32);
        assert_eq!(supplier.get(), 7);
        assert_eq!(supplier.get(), 7);
    }

    #[test]
    fn dynamic_value_is_reevaluated() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let supplier = Supplier::dynamic(move || counter_clone.fetch_add(1, Ordering::SeqCst));

        assert_eq!(supplier.get(), 0);
        assert_eq!(supplier.get(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
