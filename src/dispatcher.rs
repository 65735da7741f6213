// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dispatcher orchestrator: drives the outer dispatch loop, owns the
//! run-wide state every other component shares, and implements fail-fast.

use crate::config::DispatcherConfig;
use crate::errors::WorkerSpawnError;
use crate::job;
use crate::loader::Loader;
use crate::model::{TestCase, TestGroup, TestResult};
use crate::pool::{self, WorkerPool};
use crate::queue::WorkQueue;
use crate::registry::ResultRegistry;
use crate::reporter::Reporter;
use crate::worker::{WorkerEvent, WorkerHandle};
use std::cell::RefCell;
use std::rc::Rc;

/// Run-wide counters and flags, independent of any single job.
#[derive(Debug)]
pub(crate) struct RunState {
    pub(crate) failure_count: usize,
    pub(crate) max_failures: usize,
    pub(crate) stopped: bool,
    pub(crate) fail_fast_tripped: bool,
    pub(crate) worker_errors: bool,
}

impl RunState {
    /// `maxFailures > 0 AND failureCount >= maxFailures`.
    pub(crate) fn has_reached_max_failures(&self) -> bool {
        self.max_failures > 0 && self.failure_count >= self.max_failures
    }
}

/// Everything a job runner needs, bundled behind `Rc` so job futures can
/// each hold a cheap clone without borrowing the dispatcher itself.
pub(crate) struct Shared<R> {
    pub(crate) config: Rc<DispatcherConfig>,
    pub(crate) queue: Rc<RefCell<WorkQueue>>,
    pub(crate) registry: Rc<RefCell<ResultRegistry>>,
    pub(crate) pool: Rc<RefCell<WorkerPool>>,
    pub(crate) reporter: Rc<RefCell<R>>,
    pub(crate) state: Rc<RefCell<RunState>>,
}

impl<R> Clone for Shared<R> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            pool: self.pool.clone(),
            reporter: self.reporter.clone(),
            state: self.state.clone(),
        }
    }
}

impl<R: Reporter + 'static> Shared<R> {
    /// Increments `failureCount` if `result` counts as a failure against
    /// `test`'s expected status, and trips fail-fast the first time the
    /// threshold is reached.
    pub(crate) fn count_failure_if_needed(
        &self,
        test: &Rc<RefCell<TestCase>>,
        result: &Rc<RefCell<TestResult>>,
    ) {
        let expected = test.borrow().expected_status;
        if !result.borrow().counts_as_failure(expected) {
            return;
        }

        let mut state = self.state.borrow_mut();
        state.failure_count += 1;
        let just_tripped = state.max_failures > 0
            && state.failure_count == state.max_failures
            && !state.stopped;
        drop(state);

        if just_tripped {
            self.state.borrow_mut().fail_fast_tripped = true;
            tracing::warn!(failure_count = self.state.borrow().failure_count, "fail-fast tripped");
            self.request_stop();
        }
    }

    /// Sets the stopped flag immediately, then fires `stop()` at every live
    /// worker in the background. Used both by fail-fast and by
    /// [`Dispatcher::stop`]; errors from the stop itself are swallowed.
    pub(crate) fn request_stop(&self) {
        if self.state.borrow_mut().stopped {
            return;
        }
        self.state.borrow_mut().stopped = true;

        for worker in self.pool.borrow().live_workers() {
            tokio::task::spawn_local(async move {
                worker.stop().await;
            });
        }
    }
}

/// The final disposition of a `Dispatcher::run()` call, carrying everything
/// `hasWorkerErrors()` alone wouldn't.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    pub failure_count: usize,
    pub fail_fast_tripped: bool,
    pub stopped: bool,
    pub worker_errors: bool,
}

/// Drives a queue of test groups to completion against a pool of worker
/// processes.
pub struct Dispatcher<L, R> {
    loader: L,
    shared: Shared<R>,
    spawn_worker: Box<dyn Fn(usize, &DispatcherConfig) -> Result<WorkerHandle, WorkerSpawnError>>,
}

impl<L: Loader, R: Reporter + 'static> Dispatcher<L, R> {
    /// Builds a dispatcher for `groups`, reading pool sizing and fail-fast
    /// configuration from `loader.full_config()`.
    pub fn new(loader: L, reporter: R, groups: impl IntoIterator<Item = TestGroup>) -> Self {
        Self::with_spawn(loader, reporter, groups, WorkerHandle::spawn)
    }

    /// As [`Self::new`], but with the worker-spawning step injected:
    /// `#[cfg(test)]` callers use this to exercise the dispatch loop against
    /// an in-crate fake worker instead of a real child process.
    pub(crate) fn with_spawn(
        loader: L,
        reporter: R,
        groups: impl IntoIterator<Item = TestGroup>,
        spawn_worker: impl Fn(usize, &DispatcherConfig) -> Result<WorkerHandle, WorkerSpawnError>
            + 'static,
    ) -> Self {
        let groups: Vec<TestGroup> = groups.into_iter().collect();
        let config = loader.full_config();

        let mut registry = ResultRegistry::new();
        for group in &groups {
            for test in &group.tests {
                registry.insert(test.clone());
            }
        }

        let state = RunState {
            failure_count: 0,
            max_failures: config.max_failures,
            stopped: false,
            fail_fast_tripped: false,
            worker_errors: false,
        };

        let shared = Shared {
            pool: Rc::new(RefCell::new(WorkerPool::new(config.max_workers))),
            config: Rc::new(config),
            queue: Rc::new(RefCell::new(WorkQueue::from_groups(groups))),
            registry: Rc::new(RefCell::new(registry)),
            reporter: Rc::new(RefCell::new(reporter)),
            state: Rc::new(RefCell::new(state)),
        };

        Self {
            loader,
            shared,
            spawn_worker: Box::new(spawn_worker),
        }
    }

    pub fn has_worker_errors(&self) -> bool {
        self.shared.state.borrow().worker_errors
    }

    /// Drains the queue: while it is non-empty and the run hasn't been
    /// stopped, performs one dispatch pass. Returns once the queue is empty
    /// and every launched job has resolved, or once `stop()` has finished
    /// draining every worker.
    pub async fn run(&self) -> Result<RunSummary, WorkerSpawnError> {
        let mut spawn_error = None;

        loop {
            if self.shared.state.borrow().stopped || self.shared.queue.borrow().is_empty() {
                break;
            }

            let mut jobs = Vec::new();
            loop {
                if self.shared.state.borrow().stopped {
                    break;
                }
                let Some(group) = self.shared.queue.borrow_mut().pop_front() else {
                    break;
                };
                // Never claim a worker for an empty group.
                if group.is_empty() {
                    continue;
                }

                let worker = match self.claim_compatible_worker(&group).await {
                    Ok(Some(worker)) => worker,
                    Ok(None) => break,
                    Err(error) => {
                        self.shared.state.borrow_mut().worker_errors = true;
                        spawn_error = Some(error);
                        break;
                    }
                };

                let shared = self.shared.clone();
                jobs.push(tokio::task::spawn_local(job::run_job(shared, worker, group)));
            }

            futures::future::join_all(jobs).await;

            if spawn_error.is_some() {
                break;
            }
        }

        if let Some(error) = spawn_error {
            return Err(error);
        }

        let state = self.shared.state.borrow();
        Ok(RunSummary {
            failure_count: state.failure_count,
            fail_fast_tripped: state.fail_fast_tripped,
            stopped: state.stopped,
            worker_errors: state.worker_errors,
        })
    }

    /// Obtains a worker for `group`, discarding and re-claiming as long as
    /// the recycled worker's hash doesn't match. Returns `Ok(None)` if
    /// `stop()` was invoked mid-loop.
    async fn claim_compatible_worker(
        &self,
        group: &TestGroup,
    ) -> Result<Option<Rc<WorkerHandle>>, WorkerSpawnError> {
        let loader = &self.loader;
        let mut worker = pool::obtain(
            &self.shared.pool,
            &self.shared.config,
            group,
            &self.spawn_worker,
            || loader.serialize(),
        )
        .await?;

        while !self.shared.state.borrow().stopped {
            // A just-initialized worker's hash was bound to this group's
            // hash by construction; only a recycled worker can mismatch.
            let mismatched = worker.hash().is_some_and(|h| h != group.worker_hash);
            if !mismatched {
                return Ok(Some(worker));
            }
            // Discard it: stop, wait for the exit the pool hasn't observed
            // yet (a free-listed worker is alive, just idle), then free its
            // slot before asking for another.
            worker.stop().await;
            while let Some(event) = worker.next_event().await {
                if matches!(event, WorkerEvent::Exit) {
                    break;
                }
            }
            self.shared.pool.borrow_mut().forget_exited(&worker);
            worker = pool::obtain(
                &self.shared.pool,
                &self.shared.config,
                group,
                &self.spawn_worker,
                || loader.serialize(),
            )
            .await?;
        }
        Ok(None)
    }

    /// Sets the stopped flag, requests graceful teardown of every live
    /// worker, and awaits every exit. Idempotent: a second call still awaits
    /// drainage but sends nothing new.
    pub async fn stop(&self) {
        self.shared.request_stop();
        pool::wait_drained(&self.shared.pool).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCommand;
    use crate::ipc::{FatalError, TestBeginParams, TestEndParams};
    use crate::model::{TestCase, TestStatus};
    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::collections::VecDeque;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn test_case(id: &str, expected: TestStatus, retries: u32) -> TestCase {
        TestCase::new(id, expected, retries)
    }

    fn group(hash: &str, tests: Vec<TestCase>) -> TestGroup {
        TestGroup {
            worker_hash: hash.to_string(),
            require_file: Utf8PathBuf::from("tests.bin"),
            repeat_each_index: 0,
            project_index: 0,
            tests,
        }
    }

    fn test_begin(id: &str) -> WorkerEvent {
        WorkerEvent::TestBegin(TestBeginParams {
            test_id: id.to_string(),
            worker_index: 0,
            start_wall_time: chrono::Local::now(),
        })
    }

    fn test_end(id: &str, status: TestStatus, expected: TestStatus) -> WorkerEvent {
        WorkerEvent::TestEnd(TestEndParams {
            test_id: id.to_string(),
            duration_millis: 1,
            error: None,
            attachments: Vec::new(),
            status,
            expected_status: expected,
            annotations: Vec::new(),
            timeout_millis: None,
        })
    }

    fn done_ok() -> WorkerEvent {
        WorkerEvent::Done(crate::ipc::DoneParams::default())
    }

    fn done_failed(id: &str) -> WorkerEvent {
        WorkerEvent::Done(crate::ipc::DoneParams {
            failed_test_id: Some(id.to_string()),
            fatal_error: None,
        })
    }

    fn done_fatal(message: &str) -> WorkerEvent {
        WorkerEvent::Done(crate::ipc::DoneParams {
            failed_test_id: None,
            fatal_error: Some(FatalError {
                value: message.to_string(),
            }),
        })
    }

    struct FakeLoader {
        max_workers: usize,
        max_failures: usize,
    }

    impl Loader for FakeLoader {
        fn full_config(&self) -> DispatcherConfig {
            let mut config =
                DispatcherConfig::new(self.max_workers, WorkerCommand::new("fake-worker", Vec::new()));
            config.max_failures = self.max_failures;
            config
        }

        fn serialize(&self) -> serde_json::Value {
            serde_json::json!({})
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum RecordedEvent {
        TestBegin(String),
        TestEnd(String, TestStatus),
        Error(String),
    }

    /// A reporter that records every callback, for assertions after the run.
    /// Its log is handed out as a separate `Rc` clone before the reporter is
    /// moved into the dispatcher, since the dispatcher owns it from then on.
    struct RecordingReporter {
        events: Rc<RefCell<Vec<RecordedEvent>>>,
    }

    impl Reporter for RecordingReporter {
        fn on_test_begin(&mut self, test: &TestCase) {
            self.events
                .borrow_mut()
                .push(RecordedEvent::TestBegin(test.id.clone()));
        }

        fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
            self.events.borrow_mut().push(RecordedEvent::TestEnd(
                test.id.clone(),
                result.status.expect("testEnd always carries a status"),
            ));
        }

        fn on_error(&mut self, error: &str) {
            self.events.borrow_mut().push(RecordedEvent::Error(error.to_string()));
        }
    }

    fn recording_reporter() -> (RecordingReporter, Rc<RefCell<Vec<RecordedEvent>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        (
            RecordingReporter {
                events: events.clone(),
            },
            events,
        )
    }

    /// Builds a `spawn_worker` closure that hands out one scripted fake
    /// worker per call, in order, and counts how many it actually spawned:
    /// the in-crate fake worker the dispatcher and job runner are exercised
    /// against instead of a real child process.
    fn scripted_spawn(
        scripts: Vec<Vec<WorkerEvent>>,
    ) -> (
        impl Fn(usize, &DispatcherConfig) -> Result<WorkerHandle, WorkerSpawnError>,
        Rc<Cell<usize>>,
    ) {
        let scripts = Rc::new(RefCell::new(VecDeque::from(scripts)));
        let spawned = Rc::new(Cell::new(0));
        let spawned_counter = spawned.clone();
        let spawn = move |index: usize, _config: &DispatcherConfig| {
            let script = scripts
                .borrow_mut()
                .pop_front()
                .expect("test script did not provision enough workers");
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            for event in script {
                let _ = tx.send(event);
            }
            drop(tx);
            spawned_counter.set(spawned_counter.get() + 1);
            Ok(WorkerHandle::new_fake(index, None, rx).0)
        };
        (spawn, spawned)
    }

    /// Two tests in one group, both pass first try.
    #[tokio::test]
    async fn happy_path_runs_both_tests_once_and_frees_the_worker() {
        init_tracing();
        tokio::task::LocalSet::new()
            .run_until(async {
                let groups = vec![group(
                    "H",
                    vec![
                        test_case("t1", TestStatus::Passed, 0),
                        test_case("t2", TestStatus::Passed, 0),
                    ],
                )];
                let (spawn, spawned) = scripted_spawn(vec![vec![
                    test_begin("t1"),
                    test_end("t1", TestStatus::Passed, TestStatus::Passed),
                    test_begin("t2"),
                    test_end("t2", TestStatus::Passed, TestStatus::Passed),
                    done_ok(),
                    WorkerEvent::Exit,
                ]]);
                let (reporter, events) = recording_reporter();
                let loader = FakeLoader {
                    max_workers: 2,
                    max_failures: 0,
                };
                let dispatcher = Dispatcher::with_spawn(loader, reporter, groups, spawn);

                let summary = dispatcher.run().await.unwrap();

                assert_eq!(summary.failure_count, 0);
                assert!(!summary.stopped);
                assert!(!summary.worker_errors);
                assert_eq!(spawned.get(), 1);
                assert_eq!(dispatcher.shared.pool.borrow().live_worker_count(), 1);

                let registry = dispatcher.shared.registry.borrow();
                for id in ["t1", "t2"] {
                    let test = registry.get(id).unwrap();
                    let test = test.borrow();
                    assert_eq!(test.results.len(), 1);
                    assert_eq!(test.current_result().borrow().status, Some(TestStatus::Passed));
                }
                assert!(events
                    .borrow()
                    .contains(&RecordedEvent::TestEnd("t1".to_string(), TestStatus::Passed)));
                assert!(events
                    .borrow()
                    .contains(&RecordedEvent::TestEnd("t2".to_string(), TestStatus::Passed)));
            })
            .await;
    }

    /// A failed attempt on an expected-passed test with a retry budget is
    /// re-run to completion on a fresh worker.
    #[tokio::test]
    async fn failed_attempt_is_retried_on_a_fresh_worker() {
        init_tracing();
        tokio::task::LocalSet::new()
            .run_until(async {
                let groups = vec![group("H", vec![test_case("t1", TestStatus::Passed, 1)])];
                let (spawn, spawned) = scripted_spawn(vec![
                    vec![
                        test_begin("t1"),
                        test_end("t1", TestStatus::Failed, TestStatus::Passed),
                        done_failed("t1"),
                        WorkerEvent::Exit,
                    ],
                    vec![
                        test_begin("t1"),
                        test_end("t1", TestStatus::Passed, TestStatus::Passed),
                        done_ok(),
                        WorkerEvent::Exit,
                    ],
                ]);
                let (reporter, _events) = recording_reporter();
                let loader = FakeLoader {
                    max_workers: 1,
                    max_failures: 0,
                };
                let dispatcher = Dispatcher::with_spawn(loader, reporter, groups, spawn);

                let summary = dispatcher.run().await.unwrap();

                assert_eq!(summary.failure_count, 1);
                assert_eq!(spawned.get(), 2);
                assert_eq!(dispatcher.shared.pool.borrow().live_worker_count(), 1);

                let registry = dispatcher.shared.registry.borrow();
                let t1 = registry.get("t1").unwrap();
                let t1 = t1.borrow();
                assert_eq!(t1.results.len(), 2);
                assert_eq!(t1.current_result().borrow().status, Some(TestStatus::Passed));
            })
            .await;
    }

    /// A fatal error with tests still in flight attributes the first as
    /// failed and the rest as skipped, and only the failed one is
    /// re-injected: skipped outcomes are never retried.
    #[tokio::test]
    async fn fatal_error_attributes_first_as_failed_rest_as_skipped_and_retries_only_the_failed_one() {
        init_tracing();
        tokio::task::LocalSet::new()
            .run_until(async {
                let groups = vec![group(
                    "H",
                    vec![
                        test_case("t1", TestStatus::Passed, 1),
                        test_case("t2", TestStatus::Passed, 0),
                        test_case("t3", TestStatus::Passed, 0),
                    ],
                )];
                let (spawn, spawned) = scripted_spawn(vec![
                    vec![test_begin("t1"), done_fatal("boom"), WorkerEvent::Exit],
                    vec![
                        test_begin("t1"),
                        test_end("t1", TestStatus::Passed, TestStatus::Passed),
                        done_ok(),
                        WorkerEvent::Exit,
                    ],
                ]);
                let (reporter, events) = recording_reporter();
                let loader = FakeLoader {
                    max_workers: 1,
                    max_failures: 0,
                };
                let dispatcher = Dispatcher::with_spawn(loader, reporter, groups, spawn);

                let summary = dispatcher.run().await.unwrap();

                assert_eq!(summary.failure_count, 1, "only t1 counts; t2/t3 are skipped");
                assert_eq!(spawned.get(), 2);

                let registry = dispatcher.shared.registry.borrow();
                let t1 = registry.get("t1").unwrap();
                assert_eq!(t1.borrow().results.len(), 2);
                assert_eq!(
                    t1.borrow().current_result().borrow().status,
                    Some(TestStatus::Passed)
                );
                for id in ["t2", "t3"] {
                    let test = registry.get(id).unwrap();
                    let test = test.borrow();
                    assert_eq!(test.results.len(), 1, "{id} must not have been retried");
                    assert_eq!(test.current_result().borrow().status, Some(TestStatus::Skipped));
                }

                // t1's own testEnd is synthesized without a matching testBegin
                // (it had already begun); t2/t3 get a synthesized begin too.
                let recorded = events.borrow();
                assert!(recorded
                    .iter()
                    .filter(|e| matches!(e, RecordedEvent::TestBegin(id) if id == "t2"))
                    .count()
                    == 1);
                assert!(recorded.contains(&RecordedEvent::TestEnd("t2".to_string(), TestStatus::Skipped)));
                assert!(recorded.contains(&RecordedEvent::TestEnd("t3".to_string(), TestStatus::Skipped)));
            })
            .await;
    }

    /// The worker disappears mid-test with no `done` at all. Treated
    /// exactly like an in-band fatal error.
    #[tokio::test]
    async fn unannounced_worker_exit_is_treated_as_a_fatal_error() {
        init_tracing();
        tokio::task::LocalSet::new()
            .run_until(async {
                let groups = vec![group("H", vec![test_case("t1", TestStatus::Passed, 1)])];
                let (spawn, spawned) = scripted_spawn(vec![
                    vec![test_begin("t1")],
                    vec![
                        test_begin("t1"),
                        test_end("t1", TestStatus::Passed, TestStatus::Passed),
                        done_ok(),
                        WorkerEvent::Exit,
                    ],
                ]);
                let (reporter, _events) = recording_reporter();
                let loader = FakeLoader {
                    max_workers: 1,
                    max_failures: 0,
                };
                let dispatcher = Dispatcher::with_spawn(loader, reporter, groups, spawn);

                let summary = dispatcher.run().await.unwrap();

                assert_eq!(summary.failure_count, 1);
                assert_eq!(spawned.get(), 2);

                let registry = dispatcher.shared.registry.borrow();
                let t1 = registry.get("t1").unwrap();
                assert_eq!(t1.borrow().results.len(), 2);
                assert_eq!(
                    t1.borrow().current_result().borrow().status,
                    Some(TestStatus::Passed)
                );
            })
            .await;
    }

    /// Two groups fail nearly simultaneously against a `maxFailures: 1`
    /// threshold. The trip happens exactly once and silences every reporter
    /// call from then on.
    #[tokio::test]
    async fn fail_fast_trips_once_and_suppresses_further_reporter_calls() {
        init_tracing();
        tokio::task::LocalSet::new()
            .run_until(async {
                let groups = vec![
                    group("H", vec![test_case("ta", TestStatus::Passed, 0)]),
                    group("H", vec![test_case("tb", TestStatus::Passed, 0)]),
                ];
                let (spawn, spawned) = scripted_spawn(vec![
                    vec![
                        test_begin("ta"),
                        test_end("ta", TestStatus::Failed, TestStatus::Passed),
                        done_failed("ta"),
                        WorkerEvent::Exit,
                    ],
                    vec![
                        test_begin("tb"),
                        test_end("tb", TestStatus::Failed, TestStatus::Passed),
                        done_failed("tb"),
                        WorkerEvent::Exit,
                    ],
                ]);
                let (reporter, events) = recording_reporter();
                let loader = FakeLoader {
                    max_workers: 4,
                    max_failures: 1,
                };
                let dispatcher = Dispatcher::with_spawn(loader, reporter, groups, spawn);

                let summary = dispatcher.run().await.unwrap();

                assert!(summary.fail_fast_tripped);
                assert!(summary.stopped);
                assert!(summary.failure_count >= 1);
                assert_eq!(spawned.get(), 2);
                assert_eq!(
                    dispatcher.shared.pool.borrow().live_worker_count(),
                    0,
                    "both workers must have been stopped and drained"
                );

                let end_events = events
                    .borrow()
                    .iter()
                    .filter(|e| matches!(e, RecordedEvent::TestEnd(..)))
                    .count();
                assert!(
                    end_events <= 1,
                    "at most one testEnd reporter call survives the trip, got {end_events}"
                );
            })
            .await;
    }

    /// A recycled worker with a mismatched compatibility hash is discarded
    /// and replaced, never handed to an incompatible group.
    #[tokio::test]
    async fn incompatible_recycled_worker_is_discarded_and_replaced() {
        init_tracing();
        tokio::task::LocalSet::new()
            .run_until(async {
                let groups = vec![
                    group("A", vec![test_case("t1", TestStatus::Passed, 0)]),
                    group("B", vec![test_case("t2", TestStatus::Passed, 0)]),
                ];
                let (spawn, spawned) = scripted_spawn(vec![
                    vec![
                        test_begin("t1"),
                        test_end("t1", TestStatus::Passed, TestStatus::Passed),
                        done_ok(),
                        WorkerEvent::Exit,
                    ],
                    vec![
                        test_begin("t2"),
                        test_end("t2", TestStatus::Passed, TestStatus::Passed),
                        done_ok(),
                        WorkerEvent::Exit,
                    ],
                ]);
                let (reporter, _events) = recording_reporter();
                let loader = FakeLoader {
                    max_workers: 1,
                    max_failures: 0,
                };
                let dispatcher = Dispatcher::with_spawn(loader, reporter, groups, spawn);

                let summary = dispatcher.run().await.unwrap();

                assert_eq!(summary.failure_count, 0);
                assert_eq!(
                    spawned.get(),
                    2,
                    "the mismatched worker must be discarded, not reused, for G2"
                );
                assert_eq!(dispatcher.shared.pool.borrow().live_worker_count(), 1);
                assert_eq!(dispatcher.shared.pool.borrow().live_workers()[0].hash().as_deref(), Some("B"));
            })
            .await;
    }

    #[tokio::test]
    async fn request_stop_is_idempotent_and_marks_stopped_immediately() {
        init_tracing();
        let groups: Vec<TestGroup> = Vec::new();
        let (spawn, _spawned) = scripted_spawn(Vec::new());
        let (reporter, _events) = recording_reporter();
        let loader = FakeLoader {
            max_workers: 1,
            max_failures: 0,
        };
        let dispatcher = Dispatcher::with_spawn(loader, reporter, groups, spawn);

        dispatcher.shared.request_stop();
        dispatcher.shared.request_stop();

        assert!(dispatcher.shared.state.borrow().stopped);
    }

    #[tokio::test]
    async fn an_empty_queue_runs_to_completion_with_no_workers() {
        init_tracing();
        tokio::task::LocalSet::new()
            .run_until(async {
                let groups: Vec<TestGroup> = Vec::new();
                let (spawn, spawned) = scripted_spawn(Vec::new());
                let (reporter, _events) = recording_reporter();
                let loader = FakeLoader {
                    max_workers: 1,
                    max_failures: 0,
                };
                let dispatcher = Dispatcher::with_spawn(loader, reporter, groups, spawn);

                let summary = dispatcher.run().await.unwrap();

                assert_eq!(summary.failure_count, 0);
                assert!(!dispatcher.has_worker_errors());
                assert_eq!(spawned.get(), 0);
            })
            .await;
    }

    /// An empty group is never claimed a worker.
    #[tokio::test]
    async fn an_empty_group_is_skipped_without_claiming_a_worker() {
        init_tracing();
        tokio::task::LocalSet::new()
            .run_until(async {
                let groups = vec![
                    group("H", Vec::new()),
                    group("H", vec![test_case("t1", TestStatus::Passed, 0)]),
                ];
                let (spawn, spawned) = scripted_spawn(vec![vec![
                    test_begin("t1"),
                    test_end("t1", TestStatus::Passed, TestStatus::Passed),
                    done_ok(),
                    WorkerEvent::Exit,
                ]]);
                let (reporter, _events) = recording_reporter();
                let loader = FakeLoader {
                    max_workers: 1,
                    max_failures: 0,
                };
                let dispatcher = Dispatcher::with_spawn(loader, reporter, groups, spawn);

                let summary = dispatcher.run().await.unwrap();

                assert_eq!(summary.failure_count, 0);
                assert_eq!(spawned.get(), 1);
            })
            .await;
    }
}
