// Copyright (c) Microsoft Corporation.

//! Shared test doubles for unit tests.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::context::RetryContext;
use crate::listener::RetryListener;
use crate::ERR_POISONED_LOCK;

/// The failure flavor a [`StubError`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubKind {
    Transient,
    Fatal,
}

/// A minimal error type for exercising policies and the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StubError {
    kind: StubKind,
}

impl StubError {
    pub fn new(kind: StubKind) -> Self {
        Self { kind }
    }

    pub fn transient() -> Self {
        Self::new(StubKind::Transient)
    }

    pub fn fatal() -> Self {
        Self::new(StubKind::Fatal)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == StubKind::Fatal
    }
}

impl fmt::Display for StubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StubKind::Transient => write!(f, "transient failure"),
            StubKind::Fatal => write!(f, "fatal failure"),
        }
    }
}

impl std::error::Error for StubError {}

/// Records every listener notification for later assertions.
#[derive(Debug)]
pub(crate) struct RecordingListener {
    label: &'static str,
    events: Arc<Mutex<Vec<String>>>,
    approve_open: bool,
}

impl RecordingListener {
    pub fn new(label: &'static str, events: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            label,
            events,
            approve_open: true,
        })
    }

    pub fn rejecting(label: &'static str, events: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            label,
            events,
            approve_open: false,
        })
    }

    fn record(&self, event: &str) {
        self.events
            .lock()
            .expect(ERR_POISONED_LOCK)
            .push(format!("{}:{event}", self.label));
    }
}

impl RetryListener<StubError> for RecordingListener {
    fn open(&self, _context: &RetryContext<StubError>) -> bool {
        self.record("open");
        self.approve_open
    }

    fn on_success(&self, _context: &RetryContext<StubError>, _result: &dyn Any) {
        self.record("on_success");
    }

    fn on_error(&self, _context: &RetryContext<StubError>, _error: &StubError) {
        self.record("on_error");
    }

    fn close(&self, _context: &RetryContext<StubError>, _last_error: Option<&StubError>) {
        self.record("close");
    }
}
