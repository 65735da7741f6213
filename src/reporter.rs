// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reporter interface consumed by the dispatcher.
//!
//! The reporter itself, the thing that turns these calls into a terminal
//! UI or a JUnit report, is out of scope for this crate. All callbacks are
//! invoked on the dispatcher's single flow of control, so implementations
//! don't need to be `Send`/`Sync`.

use crate::model::{OutputChunk, TestCase, TestResult};

/// Callbacks the dispatcher drives as a run progresses.
///
/// Every method has a default no-op body: most reporters only care about a
/// subset of the lifecycle.
pub trait Reporter {
    fn on_test_begin(&mut self, test: &TestCase) {
        let _ = test;
    }

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        let _ = (test, result);
    }

    fn on_std_out(&mut self, chunk: &OutputChunk, test: Option<&TestCase>) {
        let _ = (chunk, test);
    }

    fn on_std_err(&mut self, chunk: &OutputChunk, test: Option<&TestCase>) {
        let _ = (chunk, test);
    }

    fn on_error(&mut self, error: &str) {
        let _ = error;
    }
}

/// A reporter that logs every callback at `debug` level via `tracing`, and
/// otherwise does nothing. Useful as a default and in tests.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn on_test_begin(&mut self, test: &TestCase) {
        tracing::debug!(test_id = %test.id, "test begin");
    }

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        tracing::debug!(test_id = %test.id, status = ?result.status, "test end");
    }

    fn on_error(&mut self, error: &str) {
        tracing::warn!(%error, "worker error");
    }
}
