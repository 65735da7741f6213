// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The data model shared by every dispatcher component: test identity,
//! results, and the groups tests are dispatched in.

use camino::Utf8PathBuf;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// The outcome of a single test attempt.
///
/// A fieldless enum is the Rust rendering of the four-way status string the
/// wire protocol carries in `testEnd.status` (see `ipc::TestEndParams`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    TimedOut,
}

/// An error attached to a `TestResult`, carried over the wire as
/// `{value, ...}` (see `ipc::FatalError`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestError {
    pub value: String,
}

impl TestError {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }
}

/// A chunk of captured output: either text as reported by the worker, or a
/// binary chunk that arrived base64-encoded over the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputChunk {
    Text(String),
    Binary(Vec<u8>),
}

/// An attachment reported alongside a `testEnd`.
#[derive(Clone, Debug)]
pub struct Attachment {
    pub name: String,
    pub path: Option<Utf8PathBuf>,
    pub content_type: String,
    pub body: Option<Vec<u8>>,
}

/// A single attempt at running a test. Created blank by the owning
/// `TestCase` at retry time; the dispatcher only ever appends a new blank
/// result and rebinds its notion of "the current result", never mutating
/// a result that a previous attempt's event handlers might still be holding
/// a reference to.
#[derive(Clone, Debug, Default)]
pub struct TestResult {
    pub worker_index: Option<usize>,
    pub start_time: Option<DateTime<Local>>,
    pub duration: Duration,
    pub status: Option<TestStatus>,
    pub error: Option<TestError>,
    pub stdout: Vec<OutputChunk>,
    pub stderr: Vec<OutputChunk>,
    pub attachments: Vec<Attachment>,
}

impl TestResult {
    pub fn blank() -> Self {
        Self::default()
    }

    /// Whether this attempt's terminal status counts as an unexpected
    /// failure against `expected`. A `skipped` status never counts.
    pub fn counts_as_failure(&self, expected: TestStatus) -> bool {
        match self.status {
            Some(TestStatus::Skipped) => false,
            Some(status) => status != expected,
            None => false,
        }
    }
}

/// A test's stable identity plus its append-only attempt history.
///
/// `results` holds one `Rc<RefCell<TestResult>>` per attempt. A retry
/// *appends* a fresh one rather than mutating the last entry in place, so
/// that anything still holding a clone of a prior attempt's `Rc` keeps
/// observing that attempt's data even after a new one starts: event
/// handlers holding a prior result reference never observe writes meant
/// for a later attempt.
#[derive(Clone, Debug)]
pub struct TestCase {
    pub id: String,
    pub expected_status: TestStatus,
    pub retries: u32,
    pub results: Vec<Rc<RefCell<TestResult>>>,
    /// Updated from each `testEnd`: free-form labels the worker attaches
    /// to a test, independent of pass/fail status.
    pub annotations: Vec<String>,
    /// Updated from each `testEnd`: the timeout the worker enforced for
    /// the most recent attempt.
    pub timeout: Option<Duration>,
}

impl TestCase {
    pub fn new(id: impl Into<String>, expected_status: TestStatus, retries: u32) -> Self {
        Self {
            id: id.into(),
            expected_status,
            retries,
            results: vec![Rc::new(RefCell::new(TestResult::blank()))],
            annotations: Vec::new(),
            timeout: None,
        }
    }

    /// The attempt currently being written to, always the last element.
    pub fn current_result(&self) -> Rc<RefCell<TestResult>> {
        self.results
            .last()
            .expect("a TestCase always has at least one result")
            .clone()
    }

    /// Whether a further attempt is allowed: retries only ever apply to
    /// tests expected to pass, and only while the retry budget holds out.
    pub fn may_retry(&self) -> bool {
        self.expected_status == TestStatus::Passed
            && self.results.len() < self.retries as usize + 1
    }

    /// Appends a fresh blank result, returning it. This is the only way a
    /// retry attempt is created; `results` is never mutated any other way.
    pub fn begin_retry(&mut self) -> Rc<RefCell<TestResult>> {
        let result = Rc::new(RefCell::new(TestResult::blank()));
        self.results.push(result.clone());
        result
    }
}

/// A batch of tests sharing a compatibility hash and execution parameters,
/// dispatched to a single worker as one unit. Immutable once enqueued; a
/// partially completed group is replaced wholesale by a new one carrying
/// the remaining tests.
#[derive(Clone, Debug)]
pub struct TestGroup {
    pub worker_hash: String,
    pub require_file: Utf8PathBuf,
    pub repeat_each_index: usize,
    pub project_index: usize,
    pub tests: Vec<TestCase>,
}

impl TestGroup {
    /// Builds the re-injected group for the tests still `remaining` after a
    /// job terminates, preserving every other field of the original group.
    pub fn with_remaining(&self, tests: Vec<TestCase>) -> Self {
        Self {
            worker_hash: self.worker_hash.clone(),
            require_file: self.require_file.clone(),
            repeat_each_index: self.repeat_each_index,
            project_index: self.project_index,
            tests,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}
