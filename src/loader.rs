// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The loader interface consumed by the dispatcher.
//!
//! Test discovery and the serialized image shipped to workers are out of
//! scope for this crate; this trait is the narrow seam the dispatcher
//! needs from whatever owns that machinery.

use crate::config::DispatcherConfig;

/// Supplies the dispatcher with the configuration to run under and the
/// opaque payload to forward to every worker's `init` command.
pub trait Loader {
    /// The resolved configuration for this run.
    fn full_config(&self) -> DispatcherConfig;

    /// An opaque payload forwarded verbatim to each worker's `init`
    /// command. The dispatcher never inspects its contents.
    fn serialize(&self) -> serde_json::Value;
}
