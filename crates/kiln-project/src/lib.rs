//! Project and package model of the content build pipeline.
//!
//! A *project* is a directory with a fixed layout: source packages under
//! `packages/`, build databases under `database/`, compiler executables
//! under `processors/`, plus the `pipeline.json` and `platform.json`
//! configuration files. A *package* is a `<name>.source/` directory of
//! source files that build together, with one `<name>.<platform>.target/`
//! directory per platform flavor it is built for.
//!
//! This crate only models the on-disk layout; the build itself lives in
//! the data-build crate.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]
#![warn(missing_docs)]

use std::path::PathBuf;

use thiserror::Error;

/// Project layout error.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error carrying the offending path.
    #[error("IO on '{0}' failed with {1}")]
    Io(PathBuf, #[source] std::io::Error),
    /// Configuration file parsing error.
    #[error("Parsing '{0}' failed with {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
    /// A path that is expected to live under a package root does not.
    #[error("Path '{path}' is not under package root '{root}'")]
    OutsidePackage {
        /// The package root the path was resolved against.
        root: PathBuf,
        /// The offending path.
        path: PathBuf,
    },
    /// A path that cannot be represented as UTF-8.
    #[error("Path '{0}' is not valid UTF-8")]
    NonUtf8Path(PathBuf),
}

mod pipeline;
mod project;
mod resource_path;

pub use pipeline::{load_platform_names, CompilerLaunch, Pipeline};
pub use project::{normalize_platform, Package, Project, GENERIC_PLATFORM};
pub use resource_path::{relative_to, ResourcePath};
