//! A SysV/BSD-style process-1 init and service supervisor.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binaries (src/bin/).
use serde_json as _;
use strum as _;
use tracing_subscriber as _;
// Test dependencies are only used in test code.
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;

/// Control protocol frames, server, and client.
pub mod api;

/// CLI parsing.
pub mod cli;

/// Condition facts.
pub mod conds;

/// Config loading.
pub mod config;

/// Errors.
pub mod error;

/// Event-loop plumbing.
pub mod event;

/// Socket activation.
pub mod inetd;

/// Service log sinks.
pub mod logging;

/// Reload reconciliation.
pub mod reconcile;

/// Service registry.
pub mod registry;

/// Runlevel masks and governor.
pub mod runlevel;

/// Runtime paths.
pub mod runtime;

/// Service records and state machine vocabulary.
pub mod service;

/// Child supervision.
pub mod spawn;

/// The supervisor context and event loop.
pub mod supervisor;
