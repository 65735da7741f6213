// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker handle: owns one child process, exposes a typed event stream
//! inbound and a small command surface outbound.

use crate::config::DispatcherConfig;
use crate::errors::{WorkerIoError, WorkerSpawnError};
use crate::ipc::{
    DoneParams, InitParams, ParentMessage, RunEntry, RunParams, StdChunkParams,
    TeardownErrorParams, TestBeginParams, TestEndParams,
};
use crate::model::TestGroup;
use std::cell::{Cell, RefCell};
use std::io::IsTerminal;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// An event re-emitted by a worker child.
///
/// A sum type matched exhaustively by the job runner: the terminal-event set
/// (`Done`, `Exit`) is explicit, and adding a new wire method without
/// teaching the job runner about it is a compile error rather than a
/// silently dropped event.
#[derive(Debug)]
pub enum WorkerEvent {
    TestBegin(TestBeginParams),
    TestEnd(TestEndParams),
    StdOut(StdChunkParams),
    StdErr(StdChunkParams),
    TeardownError(TeardownErrorParams),
    Done(DoneParams),
    /// Emitted once when the child process exits, whether or not `stop()`
    /// was requested first.
    Exit,
}

impl From<crate::ipc::ChildMessage> for WorkerEvent {
    fn from(msg: crate::ipc::ChildMessage) -> Self {
        use crate::ipc::ChildMessage as M;
        match msg {
            M::TestBegin(p) => WorkerEvent::TestBegin(p),
            M::TestEnd(p) => WorkerEvent::TestEnd(p),
            M::StdOut(p) => WorkerEvent::StdOut(p),
            M::StdErr(p) => WorkerEvent::StdErr(p),
            M::TeardownError(p) => WorkerEvent::TeardownError(p),
            M::Done(p) => WorkerEvent::Done(p),
        }
    }
}

/// One live worker child process.
///
/// `hash` is empty until the first `init` completes, then fixed for the
/// worker's lifetime. `did_send_stop` is a one-way latch distinguishing an
/// intentional stop from an unexpected exit.
///
/// Every method takes `&self`: the single-threaded cooperative model means
/// at most one job runner ever touches a given handle at a time, so
/// `RefCell`/`Cell` interior mutability is sufficient and avoids threading
/// `&mut` borrows through the pool's free list.
pub struct WorkerHandle {
    index: usize,
    hash: RefCell<Option<String>>,
    stdin: RefCell<StdinSink>,
    // `Some` until `init` hands the child and reader off to the background
    // task that turns subsequent lines into `WorkerEvent`s. Left `None` for
    // a fake worker, which wires its `events` channel directly instead.
    pending: RefCell<Option<(Child, BufReader<ChildStdout>)>>,
    events: RefCell<Option<UnboundedReceiver<WorkerEvent>>>,
    did_send_stop: Cell<bool>,
}

/// Where `write()` sends an encoded command line.
enum StdinSink {
    Real(ChildStdin),
    /// Records lines instead of writing them anywhere, for the in-crate
    /// fake worker used in tests.
    #[cfg(test)]
    Fake(std::rc::Rc<RefCell<Vec<Vec<u8>>>>),
}

impl WorkerHandle {
    /// Spawns the child process and assigns it `index`. Does not send
    /// `init`: that's a separate call so the pool can observe spawn
    /// failures before committing the worker to a group.
    pub fn spawn(index: usize, config: &DispatcherConfig) -> Result<Self, WorkerSpawnError> {
        let mut command = Command::new(&config.worker_command.program);
        command
            .args(&config.worker_command.args)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        command.stderr(if config.debug_worker_io {
            Stdio::inherit()
        } else {
            Stdio::null()
        });

        let is_tty = std::io::stdout().is_terminal();
        command
            .env("FORCE_COLOR", if is_tty { "1" } else { "0" })
            .env("DEBUG_COLORS", if is_tty { "1" } else { "0" })
            .env("TEST_WORKER_INDEX", index.to_string());

        let mut child: Child = command.spawn().map_err(|source| WorkerSpawnError {
            command: config.worker_command.program.to_string(),
            source,
        })?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        Ok(Self {
            index,
            hash: RefCell::new(None),
            stdin: RefCell::new(StdinSink::Real(stdin)),
            pending: RefCell::new(Some((child, BufReader::new(stdout)))),
            events: RefCell::new(None),
            did_send_stop: Cell::new(false),
        })
    }

    /// Builds a worker handle with no backing process: `events_rx` supplies
    /// the event stream directly, and outbound commands are recorded rather
    /// than written anywhere. Used to exercise the job runner and
    /// dispatcher's dispatch loop without spawning anything.
    #[cfg(test)]
    pub(crate) fn new_fake(
        index: usize,
        hash: Option<String>,
        events_rx: UnboundedReceiver<WorkerEvent>,
    ) -> (Self, std::rc::Rc<RefCell<Vec<Vec<u8>>>>) {
        let sent = std::rc::Rc::new(RefCell::new(Vec::new()));
        let handle = Self {
            index,
            hash: RefCell::new(hash),
            stdin: RefCell::new(StdinSink::Fake(sent.clone())),
            pending: RefCell::new(None),
            events: RefCell::new(Some(events_rx)),
            did_send_stop: Cell::new(false),
        };
        (handle, sent)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The compatibility hash this worker was initialized with, or `None`
    /// for a worker that hasn't completed `init` yet.
    pub fn hash(&self) -> Option<String> {
        self.hash.borrow().clone()
    }

    pub fn did_send_stop(&self) -> bool {
        self.did_send_stop.get()
    }

    /// Sends `init`, awaits the ready acknowledgement, and starts the
    /// background task that turns further stdout lines into `WorkerEvent`s.
    /// Must be called exactly once, before `run`.
    pub async fn init(&self, group: &TestGroup, loader_payload: serde_json::Value) {
        self.write(&ParentMessage::Init(InitParams {
            worker_index: self.index,
            repeat_each_index: group.repeat_each_index,
            project_index: group.project_index,
            loader: loader_payload,
        }))
        .await;

        // A fake worker has no `pending` child: its `events` channel is
        // already wired up by the test harness that created it.
        if let Some((child, mut reader)) = self.pending.borrow_mut().take() {
            // The ready ack is a one-shot unnamed message; it is consumed
            // here and never re-dispatched as a `WorkerEvent`.
            let mut ack_line = String::new();
            let _ = reader.read_line(&mut ack_line).await;

            let (tx, rx) = mpsc::unbounded_channel();
            *self.events.borrow_mut() = Some(rx);
            tokio::task::spawn_local(drive_events(child, reader, tx));
        }

        *self.hash.borrow_mut() = Some(group.worker_hash.clone());
    }

    /// Sends `run`. Does not wait for completion; results stream back as
    /// `WorkerEvent`s terminating in `Done`.
    pub async fn run(&self, group: &TestGroup) {
        let entries = group
            .tests
            .iter()
            .map(|t| RunEntry {
                test_id: t.id.clone(),
                retry: t.results.len() - 1,
            })
            .collect();
        self.write(&ParentMessage::Run(RunParams {
            file: group.require_file.to_string(),
            entries,
        }))
        .await;
    }

    /// Requests graceful teardown. Idempotent: only the first call sends
    /// anything to the child.
    pub async fn stop(&self) {
        if self.did_send_stop.replace(true) {
            return;
        }
        self.write(&ParentMessage::Stop).await;
    }

    /// Awaits the next event from the child. Must not be called
    /// concurrently with itself on the same handle: at most one job runner
    /// is attached at a time.
    pub async fn next_event(&self) -> Option<WorkerEvent> {
        let mut guard = self.events.borrow_mut();
        let rx = guard
            .as_mut()
            .expect("next_event called before init completed");
        rx.recv().await
    }

    /// Writes one command to the child's stdin. A dead child closes its
    /// stdin pipe; that must not raise above the handle, so write errors
    /// are logged and swallowed here rather than propagated.
    async fn write(&self, message: &ParentMessage) {
        let mut line = match serde_json::to_vec(message) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(worker_index = self.index, %error, "failed to encode command");
                return;
            }
        };
        line.push(b'\n');

        let mut sink = self.stdin.borrow_mut();
        match &mut *sink {
            StdinSink::Real(stdin) => {
                if let Err(source) = stdin.write_all(&line).await {
                    let error = WorkerIoError::Write(source);
                    tracing::debug!(worker_index = self.index, %error, "write to dead worker ignored");
                    return;
                }
                let _ = stdin.flush().await;
            }
            #[cfg(test)]
            StdinSink::Fake(sent) => {
                sent.borrow_mut().push(line);
            }
        }
    }
}

/// Reads events off the child's stdout until EOF, then reaps the process
/// and emits a final `Exit`. Owns `child` for exactly this reason: nothing
/// else needs it once its pipes have been handed out.
async fn drive_events(
    mut child: Child,
    mut reader: BufReader<ChildStdout>,
    tx: UnboundedSender<WorkerEvent>,
) {
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<crate::ipc::ChildMessage>(trimmed) {
                    Ok(msg) => {
                        if tx.send(WorkerEvent::from(msg)).is_err() {
                            break;
                        }
                    }
                    Err(source) => {
                        let error = WorkerIoError::Decode {
                            line: trimmed.to_string(),
                            source,
                        };
                        tracing::warn!(%error, "worker sent an unparseable message");
                    }
                }
            }
            Err(source) => {
                let error = WorkerIoError::Read(source);
                tracing::warn!(%error, "error reading from worker stdout");
                break;
            }
        }
    }
    let _ = child.wait().await;
    let _ = tx.send(WorkerEvent::Exit);
}
