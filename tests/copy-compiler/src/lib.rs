//! Test compiler that copies its source file to the output location.
//!
//! The source text drives the outcome:
//! - a line `fail` makes compilation fail,
//! - every `ref: <path>` line (relative to the source file's directory)
//!   is reported back as a reference.

use std::{fs, path::Path};

use kiln_worker::{protocol::BuildRequest, worker_api::BuildOutput};

/// Name of the produced executable.
pub const BIN_NAME: &str = "compiler-copy";

/// Compiles one request by copying the source to `<target>.bin`.
pub fn compile(request: &BuildRequest) -> BuildOutput {
    let text = match fs::read_to_string(&request.source_path) {
        Ok(text) => text,
        Err(e) => {
            return BuildOutput::failure(vec![format!(
                "cannot read {}: {e}",
                request.source_path.display()
            )])
        }
    };

    if text.lines().any(|line| line.trim() == "fail") {
        return BuildOutput::failure(vec![format!(
            "refused to compile {}",
            request.source_path.display()
        )]);
    }

    let source_dir = request
        .source_path
        .parent()
        .map_or_else(Default::default, Path::to_path_buf);
    let references = text
        .lines()
        .filter_map(|line| line.trim().strip_prefix("ref:"))
        .map(|reference| source_dir.join(reference.trim()))
        .collect();

    let output = request.target_path.with_extension("bin");
    if let Err(e) = fs::write(&output, text.as_bytes()) {
        return BuildOutput::failure(vec![format!("cannot write {}: {e}", output.display())]);
    }

    BuildOutput::success(vec![output], references)
}
