//! Data compiler interface.
//!
//! A data compiler is an executable that receives build requests on its
//! stdin and answers results on its stdout, one JSON message per line as
//! defined by [`protocol`](crate::protocol). [`run_worker`] is the loop a
//! compiler's `main()` hands control to, reducing a compiler to a single
//! callback:
//!
//! ```no_run
//! use kiln_worker::worker_api::{run_worker, BuildOutput};
//!
//! fn main() {
//!     std::process::exit(
//!         match run_worker(1, |request| {
//!             // transform request.source_path into files derived from
//!             // request.target_path, then report them.
//!             BuildOutput::success(vec![request.target_path.with_extension("bin")], vec![])
//!         }) {
//!             Ok(()) => 0,
//!             Err(_) => 1,
//!         },
//!     );
//! }
//! ```
//!
//! The loop answers version queries itself, calls the callback once per
//! build request, and returns when the engine closes the pipe.

use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};

use crate::{
    protocol::{BuildRequest, BuildResult, Message, VersionData},
    Error,
};

/// What a compiler callback produced for one request.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Whether compilation succeeded.
    pub success: bool,
    /// Error strings for a failed compilation.
    pub errors: Vec<String>,
    /// Absolute paths of the produced files, primary output first.
    pub outputs: Vec<PathBuf>,
    /// Absolute paths of files the source references.
    pub references: Vec<PathBuf>,
}

impl BuildOutput {
    /// A successful compilation.
    pub fn success(outputs: Vec<PathBuf>, references: Vec<PathBuf>) -> Self {
        Self {
            success: true,
            errors: vec![],
            outputs,
            references,
        }
    }

    /// A failed compilation.
    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
            outputs: vec![],
            references: vec![],
        }
    }
}

/// Runs the worker side of the IPC protocol until stdin closes, invoking
/// `build` once per received build request.
pub fn run_worker<F>(version: u32, mut build: F) -> Result<(), Error>
where
    F: FnMut(&BuildRequest) -> BuildOutput,
{
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line.map_err(Error::Stdio)?;
        if line.trim().is_empty() {
            continue;
        }
        let message = match Message::from_line(&line) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("ignoring unparseable build message: {e}");
                continue;
            }
        };

        let reply = match message {
            Message::VersionQuery => Some(Message::VersionData(VersionData { version })),
            Message::BuildRequest(request) => {
                let output = build(&request);
                Some(Message::BuildResult(BuildResult {
                    source_path: request.source_path,
                    target_path: request.target_path,
                    platform: request.platform,
                    success: output.success,
                    errors: output.errors,
                    outputs: output.outputs,
                    references: output.references,
                }))
            }
            // engine-bound messages are never addressed to a worker.
            Message::VersionData(_) | Message::BuildResult(_) => None,
        };

        if let Some(reply) = reply {
            writeln!(stdout, "{}", reply.to_line()).map_err(Error::Stdio)?;
            stdout.flush().map_err(Error::Stdio)?;
        }
    }

    Ok(())
}
