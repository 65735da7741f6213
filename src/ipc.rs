// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The wire format exchanged with worker child processes.
//!
//! Framing is newline-delimited JSON over the child's stdin (commands sent
//! by the parent) and stdout (events emitted by the child) pipes, since
//! `tokio::process` gives us stdio pipes rather than an arbitrary extra fd.
//! Every line decodes to one `{method, params}` object.

use serde::{Deserialize, Serialize};

/// A command sent from the dispatcher to a worker child.
#[derive(Debug, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum ParentMessage {
    Init(InitParams),
    Run(RunParams),
    Stop,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    pub worker_index: usize,
    pub repeat_each_index: usize,
    pub project_index: usize,
    /// Opaque payload produced by `Loader::serialize`, forwarded verbatim.
    pub loader: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RunEntry {
    pub test_id: String,
    /// `results.len() - 1` at the time the entry was sent: which attempt
    /// this is, zero-indexed.
    pub retry: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParams {
    pub file: String,
    pub entries: Vec<RunEntry>,
}

/// An event emitted by a worker child, one per NDJSON line on its stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum ChildMessage {
    TestBegin(TestBeginParams),
    TestEnd(TestEndParams),
    StdOut(StdChunkParams),
    StdErr(StdChunkParams),
    TeardownError(TeardownErrorParams),
    Done(DoneParams),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestBeginParams {
    pub test_id: String,
    pub worker_index: usize,
    pub start_wall_time: chrono::DateTime<chrono::Local>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAttachment {
    pub name: String,
    pub path: Option<String>,
    pub content_type: String,
    /// Base64-encoded body, if the attachment carries one inline.
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEndParams {
    pub test_id: String,
    pub duration_millis: u64,
    pub error: Option<FatalError>,
    #[serde(default)]
    pub attachments: Vec<WireAttachment>,
    pub status: crate::model::TestStatus,
    pub expected_status: crate::model::TestStatus,
    #[serde(default)]
    pub annotations: Vec<String>,
    pub timeout_millis: Option<u64>,
}

/// Exactly one of `text`/`buffer` is present.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdChunkParams {
    pub test_id: Option<String>,
    pub text: Option<String>,
    pub buffer: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownErrorParams {
    pub error: FatalError,
}

#[derive(Debug, Deserialize)]
pub struct FatalError {
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneParams {
    pub failed_test_id: Option<String>,
    pub fatal_error: Option<FatalError>,
}
