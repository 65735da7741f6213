// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by the dispatcher.
//!
//! `WorkerSpawnError` is the one variant that actually propagates out of a
//! normal run, since it happens before a worker is trusted to run anything
//! at all. `WorkerIoError` and `DecodeError` never escape a handle: a dead
//! or misbehaving worker becomes a test result or `hasWorkerErrors`, never
//! a raised error, but both types are still constructed at their failure
//! site so the logged message carries structured context instead of a bare
//! `io::Error`/`base64::DecodeError`.

use std::io;
use thiserror::Error;

/// An error spawning a worker child process.
#[derive(Debug, Error)]
#[error("failed to spawn worker process (command: {command})")]
#[non_exhaustive]
pub struct WorkerSpawnError {
    pub(crate) command: String,
    #[source]
    pub(crate) source: io::Error,
}

/// An error writing a command to, or reading an event from, a worker's IPC
/// pipes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerIoError {
    #[error("failed to write to worker stdin")]
    Write(#[source] io::Error),

    #[error("failed to read from worker stdout")]
    Read(#[source] io::Error),

    #[error("worker sent a message that could not be decoded: {line}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

/// An error decoding a base64-encoded output chunk or attachment body.
#[derive(Debug, Error)]
#[error("failed to decode base64 payload")]
pub struct DecodeError(#[source] pub(crate) base64::DecodeError);
