// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dispatcher configuration.
//!
//! The dispatcher crate itself never reads configuration files, that is
//! the host's job, same as `nextest-runner` separates `config.rs` (file
//! I/O) from `runner/` (consumes an already-parsed profile). This type is
//! the resolved configuration a `Loader` hands the dispatcher, plus the
//! worker entry point the embedding test-runner binary supplies.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// How to launch a worker child process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: Utf8PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<Utf8PathBuf>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }
}

/// Configuration for a dispatcher run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// The bound on concurrently live worker processes.
    pub max_workers: usize,
    /// Fail-fast threshold. `0` disables fail-fast regardless of the
    /// observed failure count.
    pub max_failures: usize,
    /// How to spawn a worker.
    pub worker_command: WorkerCommand,
    /// Route worker stderr to the dispatcher's own stderr instead of
    /// discarding it.
    pub debug_worker_io: bool,
}

impl DispatcherConfig {
    pub fn new(max_workers: usize, worker_command: WorkerCommand) -> Self {
        Self {
            max_workers,
            max_failures: 0,
            worker_command,
            debug_worker_io: false,
        }
    }

    pub fn fail_fast_enabled(&self) -> bool {
        self.max_failures > 0
    }
}
