// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The job runner: drives one `(worker, group)` pair to completion,
//! interprets the worker's terminal signal, and applies retry / fatal-error
//! / fail-fast policy.

use crate::dispatcher::Shared;
use crate::errors::DecodeError;
use crate::ipc::{DoneParams, FatalError, StdChunkParams, TestEndParams};
use crate::model::{Attachment, OutputChunk, TestCase, TestError, TestStatus};
use crate::reporter::Reporter;
use crate::worker::{WorkerEvent, WorkerHandle};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

/// Runs one `(worker, group)` pair to completion: sends `run`, interprets
/// the worker's event stream, applies retry and fatal-error policy, and
/// returns the worker to the pool's free list or discards it.
pub(crate) async fn run_job<R: Reporter + 'static>(
    shared: Shared<R>,
    worker: Rc<WorkerHandle>,
    group: crate::model::TestGroup,
) {
    // Seeded from the group and trimmed by `testEnd`; order is preserved so
    // fatal-error attribution and re-injection both see the group's
    // original test order.
    let mut remaining: VecDeque<String> = group.tests.iter().map(|t| t.id.clone()).collect();
    let mut last_started: Option<String> = None;

    worker.run(&group).await;

    let (done, already_exited) = loop {
        match worker.next_event().await {
            Some(WorkerEvent::TestBegin(p)) => {
                last_started = Some(p.test_id.clone());
                on_test_begin(&shared, &p.test_id, p.worker_index, p.start_wall_time);
            }
            Some(WorkerEvent::TestEnd(p)) => {
                remaining.retain(|id| id != &p.test_id);
                on_test_end(&shared, &p);
            }
            Some(WorkerEvent::StdOut(p)) => on_std_chunk(&shared, &p, false),
            Some(WorkerEvent::StdErr(p)) => on_std_chunk(&shared, &p, true),
            Some(WorkerEvent::TeardownError(p)) => {
                shared.state.borrow_mut().worker_errors = true;
                shared.reporter.borrow_mut().on_error(&p.error.value);
            }
            Some(WorkerEvent::Done(p)) => break (p, false),
            Some(WorkerEvent::Exit) | None => {
                // Synthesize `done`: a stop we requested produces a clean
                // `{}`; an unannounced exit is treated as worker-fatal.
                let synthesized = if worker.did_send_stop() {
                    DoneParams::default()
                } else {
                    DoneParams {
                        failed_test_id: None,
                        fatal_error: Some(FatalError {
                            value: "Worker process exited unexpectedly".to_string(),
                        }),
                    }
                };
                break (synthesized, true);
            }
        }
    };

    if done.failed_test_id.is_none() && done.fatal_error.is_none() && remaining.is_empty() {
        // Clean finish (policy 1): the worker is still trusted.
        shared.pool.borrow_mut().release(worker);
        return;
    }

    // Anything else (policy 2): the worker is not trusted to run more.
    worker.stop().await;

    let mut failed_ids: Vec<String> = Vec::new();
    if let Some(fatal) = &done.fatal_error {
        let mut iter = remaining.iter().cloned();
        if let Some(first) = iter.next() {
            report_fatal_test(&shared, &first, fatal, true, last_started.as_deref());
            failed_ids.push(first);
            for id in iter {
                if shared.state.borrow().has_reached_max_failures() {
                    break;
                }
                report_fatal_test(&shared, &id, fatal, false, last_started.as_deref());
                failed_ids.push(id);
            }
        }
        // Under a fatal error, nothing else from this group is left to run.
        remaining.clear();
    } else if let Some(failed_id) = &done.failed_test_id {
        failed_ids.push(failed_id.clone());
    }

    // Retry selection (policy 3): only for tests expected to pass, still
    // within their retry budget, and only while the run hasn't been
    // stopped. A test fatal-attributed as `skipped` (everything after the
    // first under a fatal error) never qualifies even though it shares
    // `expectedStatus == passed` with the first: `counts_as_failure`
    // excludes `skipped` outcomes, so retries never apply to them.
    for test_id in &failed_ids {
        if shared.state.borrow().stopped {
            continue;
        }
        let Some(test_rc) = shared.registry.borrow().get(test_id) else {
            continue;
        };
        let should_retry = {
            let test = test_rc.borrow();
            let result = test.current_result();
            let counts = result.borrow().counts_as_failure(test.expected_status);
            counts && test.may_retry()
        };
        if should_retry {
            let fresh_id = {
                let mut test = test_rc.borrow_mut();
                test.begin_retry();
                test.id.clone()
            };
            remaining.push_front(fresh_id);
        }
    }

    // Re-injection (policy 4): construct a new group from the surviving
    // metadata plus whatever is still remaining, and push it to the
    // queue's front.
    if !remaining.is_empty() {
        let registry = shared.registry.borrow();
        let tests: Vec<TestCase> = remaining
            .iter()
            .filter_map(|id| registry.get(id))
            .map(|rc| rc.borrow().clone())
            .collect();
        drop(registry);
        shared.queue.borrow_mut().push_front(group.with_remaining(tests));
    }

    // Wait for the worker to actually exit before freeing its pool slot:
    // the pool shrinks, and a claimer is resumed, only once the exit is
    // observed, unless we already saw it.
    if !already_exited {
        while let Some(event) = worker.next_event().await {
            if matches!(event, WorkerEvent::Exit) {
                break;
            }
        }
    }
    shared.pool.borrow_mut().forget_exited(&worker);
}

fn on_test_begin<R: Reporter>(
    shared: &Shared<R>,
    test_id: &str,
    worker_index: usize,
    start_wall_time: chrono::DateTime<chrono::Local>,
) {
    let Some(test_rc) = shared.registry.borrow().get(test_id) else {
        return;
    };
    let result_rc = test_rc.borrow().current_result();
    {
        let mut result = result_rc.borrow_mut();
        result.worker_index = Some(worker_index);
        result.start_time = Some(start_wall_time);
    }
    // Only the reporter callback is suppressed once fail-fast has tripped;
    // the result bookkeeping above always happens.
    if !shared.state.borrow().has_reached_max_failures() {
        shared.reporter.borrow_mut().on_test_begin(&test_rc.borrow());
    }
}

fn on_test_end<R: Reporter>(shared: &Shared<R>, params: &TestEndParams) {
    let Some(test_rc) = shared.registry.borrow().get(&params.test_id) else {
        return;
    };
    let result_rc = test_rc.borrow().current_result();
    {
        let mut result = result_rc.borrow_mut();
        result.duration = Duration::from_millis(params.duration_millis);
        result.status = Some(params.status);
        result.error = params.error.as_ref().map(|e| TestError::new(e.value.clone()));
        result.attachments = params.attachments.iter().map(decode_attachment).collect();
    }
    {
        let mut test = test_rc.borrow_mut();
        test.expected_status = params.expected_status;
        test.annotations = params.annotations.clone();
        test.timeout = params.timeout_millis.map(Duration::from_millis);
    }
    // Failure counting is unconditional: `failureCount` is monotonically
    // non-decreasing regardless of fail-fast suppression, only the
    // reporter callback is suppressed.
    shared.count_failure_if_needed(&test_rc, &result_rc);
    if !shared.state.borrow().has_reached_max_failures() {
        shared
            .reporter
            .borrow_mut()
            .on_test_end(&test_rc.borrow(), &result_rc.borrow());
    }
}

/// Applies fatal-error attribution to a single test that was never
/// terminated by its own `testEnd`: the first reported test is `failed`,
/// the rest are `skipped`, all sharing the fatal error.
fn report_fatal_test<R: Reporter>(
    shared: &Shared<R>,
    test_id: &str,
    fatal: &FatalError,
    is_first: bool,
    last_started: Option<&str>,
) {
    let Some(test_rc) = shared.registry.borrow().get(test_id) else {
        return;
    };
    let result_rc = test_rc.borrow().current_result();
    let status = if is_first {
        TestStatus::Failed
    } else {
        TestStatus::Skipped
    };
    {
        let mut result = result_rc.borrow_mut();
        result.status = Some(status);
        result.error = Some(TestError::new(fatal.value.clone()));
    }

    if !shared.state.borrow().has_reached_max_failures() {
        if last_started != Some(test_id) {
            shared.reporter.borrow_mut().on_test_begin(&test_rc.borrow());
        }
        shared
            .reporter
            .borrow_mut()
            .on_test_end(&test_rc.borrow(), &result_rc.borrow());
    }

    shared.count_failure_if_needed(&test_rc, &result_rc);
}

fn on_std_chunk<R: Reporter>(shared: &Shared<R>, params: &StdChunkParams, is_stderr: bool) {
    let chunk = match decode_chunk(params) {
        Some(chunk) => chunk,
        None => return,
    };

    let test_rc = params.test_id.as_deref().and_then(|id| shared.registry.borrow().get(id));
    if let Some(test_rc) = &test_rc {
        let result_rc = test_rc.borrow().current_result();
        let mut result = result_rc.borrow_mut();
        if is_stderr {
            result.stderr.push(chunk.clone());
        } else {
            result.stdout.push(chunk.clone());
        }
    }

    let mut reporter = shared.reporter.borrow_mut();
    let test_ref = test_rc.as_ref().map(|rc| rc.borrow());
    let test_case = test_ref.as_deref();
    if is_stderr {
        reporter.on_std_err(&chunk, test_case);
    } else {
        reporter.on_std_out(&chunk, test_case);
    }
}

fn decode_chunk(params: &StdChunkParams) -> Option<OutputChunk> {
    if let Some(text) = &params.text {
        return Some(OutputChunk::Text(text.clone()));
    }
    if let Some(buffer) = &params.buffer {
        return decode_base64(buffer).map(OutputChunk::Binary);
    }
    None
}

fn decode_attachment(wire: &crate::ipc::WireAttachment) -> Attachment {
    Attachment {
        name: wire.name.clone(),
        path: wire.path.as_ref().map(camino::Utf8PathBuf::from),
        content_type: wire.content_type.clone(),
        body: wire.body.as_deref().and_then(decode_base64),
    }
}

fn decode_base64(value: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    match base64::engine::general_purpose::STANDARD.decode(value) {
        Ok(bytes) => Some(bytes),
        Err(source) => {
            let error = DecodeError(source);
            tracing::warn!(%error, "failed to decode base64 payload");
            None
        }
    }
}
