// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The result registry: a mapping from test id to the `TestCase` and its
//! currently active `TestResult`.

use crate::model::{TestCase, TestResult};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

/// A mapping from test id to `(TestCase, current TestResult)`.
///
/// Shared via `Rc<RefCell<_>>` rather than behind a lock: the dispatcher
/// runs single-threaded and cooperative, so there is no critical section
/// to protect, only borrow-checker bookkeeping to satisfy.
#[derive(Debug, Default)]
pub struct ResultRegistry {
    tests: IndexMap<String, Rc<RefCell<TestCase>>>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a test case, overwriting any prior entry with the same id.
    pub fn insert(&mut self, test: TestCase) {
        self.tests
            .insert(test.id.clone(), Rc::new(RefCell::new(test)));
    }

    pub fn get(&self, test_id: &str) -> Option<Rc<RefCell<TestCase>>> {
        self.tests.get(test_id).cloned()
    }

    /// The result the dispatcher is currently writing to for this test id.
    pub fn current_result(&self, test_id: &str) -> Option<Rc<RefCell<TestResult>>> {
        self.tests.get(test_id).map(|t| t.borrow().current_result())
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}
