// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Retry execution engine with pluggable policies, backoff strategies, and
//! circuit breaking.
//!
//! # Why
//!
//! Transient failures are a fact of life when calling anything that can be
//! briefly unavailable. This crate executes a fallible operation, consults a
//! [retry policy][policy] to decide whether to try again, consults a
//! [backoff policy][backoff] to decide how long to pause between attempts,
//! and, when attempts are exhausted, optionally invokes a recovery callback.
//! Everything is synchronous: the attempt loop runs on the caller's thread.
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use mulligan::Retry;
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("connection reset")]
//! struct ConnectionReset;
//!
//! let retry = Retry::<ConnectionReset>::builder()
//!     .max_attempts(4)
//!     .exponential_backoff(Duration::from_millis(50), 2.0, Duration::from_secs(5))
//!     .build();
//!
//! let mut attempts = 0;
//! let value = retry.execute(|_ctx| {
//!     attempts += 1;
//!     if attempts < 3 {
//!         Err(ConnectionReset)
//!     } else {
//!         Ok("fetched")
//!     }
//! })?;
//!
//! assert_eq!(value, "fetched");
//! # Ok::<(), mulligan::RetryError<ConnectionReset>>(())
//! ```
//!
//! # Core Types
//!
//! - [`Retry`]: the execution engine, configured through [`Retry::builder`].
//! - [`RetryContext`]: per-execution state (attempt count, last error, an
//!   open attribute bag) visible to the operation, policies, and listeners.
//! - [`RetryListener`]: hooks around attempts (`open`, `on_error`,
//!   `on_success`, `close`).
//! - [`RetryState`] and [`StatefulRetry`]: stateful retry, where a logical
//!   work item keyed by a [`RetryKey`] is retried across separate top-level
//!   invocations.
//! - [`policy`]: retry policies, including composition and a
//!   [circuit breaker][policy::CircuitBreakerRetryPolicy].
//! - [`backoff`]: fixed, uniform random, and exponential (optionally
//!   jittered) pause schedules.
//! - [`Clock`] and [`ClockControl`]: the time abstraction every pause and
//!   time window goes through, so tests control time instead of sleeping.
//!
//! # Stateful retry
//!
//! A stateless execution owns its retry loop: attempts happen back to back
//! inside one `execute` call. In stateful mode the engine caches the retry
//! context under a caller-supplied key and rethrows failures that classify
//! for rollback; the next invocation with an equal key resumes the cached
//! context where it left off. This is the shape required when the operation
//! lives inside a transaction that must unwind between attempts, such as a
//! message-driven handler redelivering the same item.
//!
//! # Thread Safety
//!
//! The engine is immutable after construction, `Send + Sync`, and cheap to
//! clone. Concurrent executions are independent; the context cache is the
//! only shared surface, and its operations are atomic.

mod builder;
mod cache;
mod classify;
mod clock;
mod clock_control;
mod context;
mod engine;
mod error;
mod listener;
mod rnd;
mod state;
mod stateful;
mod supplier;

pub mod backoff;
pub mod policy;
pub mod support;

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
pub(crate) mod testing;

pub use crate::builder::RetryBuilder;
pub use crate::cache::{CacheCapacityExceeded, MapRetryContextCache, RetryContextCache, DEFAULT_CAPACITY};
pub use crate::classify::BinaryErrorClassifier;
pub use crate::clock::{Clock, SleepInterrupted};
pub use crate::clock_control::ClockControl;
pub use crate::context::{keys, AttrValue, RetryContext};
pub use crate::engine::Retry;
pub use crate::error::RetryError;
pub use crate::listener::RetryListener;
pub use crate::state::{RetryKey, RetryState};
pub use crate::stateful::StatefulRetry;

pub(crate) const ERR_POISONED_LOCK: &str = "lock poisoned";
