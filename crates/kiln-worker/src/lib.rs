//! Compiler worker pool of the content build pipeline.
//!
//! Data compilation is handled by *workers* - external executables that
//! transform one source file into one or more output files. This crate
//! owns everything about talking to them:
//!
//! - [`protocol`] - the line-delimited JSON message format exchanged with
//!   a worker over its stdin/stdout.
//! - [`process_host`] - one long-lived child process: spawn, relay,
//!   restart on crash up to a cap.
//! - [`pool`] - the set of hosts keyed by deduplicated launch identity,
//!   routing `(resource type, platform)` pairs to the right worker and
//!   queueing one job at a time per worker.
//! - [`worker_api`] - the loop a worker executable runs on its end of the
//!   pipe, so a compiler is a single callback.
//!
//! The pool is driven serially: one consumer awaits
//! [`pool::CompilerPool::next_event`] and no two callbacks into the
//! engine run concurrently. Concurrency comes from the worker processes
//! themselves.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]
#![warn(missing_docs)]

use thiserror::Error;

/// Worker communication error.
#[derive(Error, Debug)]
pub enum Error {
    /// Reading or writing the worker's stdio failed.
    #[error("worker stdio failed with {0}")]
    Stdio(#[source] std::io::Error),
    /// A malformed IPC message.
    #[error("malformed message: {0}")]
    Protocol(#[source] serde_json::Error),
}

pub mod pool;
pub mod process_host;
pub mod protocol;
pub mod worker_api;
