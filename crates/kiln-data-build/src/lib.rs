//! Incremental build engine of the content pipeline.
//!
//! The engine turns the source files of a package into per-platform
//! output files by dispatching each one to an external compiler process
//! (see the worker crate), and keeps two databases per
//! `(package, platform)` pair to make rebuilds incremental:
//!
//! - the **source database** records every source file it has
//!   successfully built - its write time, size, and the references and
//!   dependencies reported by the compiler;
//! - the **target database** records each produced output grouping under
//!   a stable, name-derived file stem.
//!
//! A file is rebuilt when it is new, its write time or size moved, any
//! of its transitive dependencies did (or vanished), or a declared
//! output is missing on disk. Everything else is skipped as up-to-date.
//! After a run, a `package.manifest` describing all built resources is
//! written to the target directory, and the databases are saved if
//! dirty.
//!
//! # Structure on disk
//!
//! ```markdown
//!  <project>/
//!  | - pipeline.json
//!  | - platform.json
//!  | + database/
//!  | |- bundle.ps3.source.json
//!  | |- bundle.ps3.target.json
//!  | + packages/
//!  | | + bundle.source/
//!  | | |- tex/brick.texture
//!  | | |- tex/brick.ps3.texture
//!  | | + bundle.ps3.target/
//!  | |   |- package.manifest
//!  | |   |- -487ce361.bin
//!  | + processors/
//!  |   |- compiler-texture
//! ```
//!
//! Builds are driven serially: the [`ProjectBuilder`] owns the compiler
//! pool, a [`PackageBuilder`] drives one package at a time, and no two
//! engine callbacks run concurrently. Worker processes provide all the
//! parallelism there is.

// crate-specific lint exceptions:
#![allow(clippy::missing_errors_doc)]
#![warn(missing_docs)]

use std::path::PathBuf;

use thiserror::Error;

/// Data build error.
#[derive(Error, Debug)]
pub enum Error {
    /// Project layout error.
    #[error("Project-related error: '{0}'")]
    Project(#[from] kiln_project::Error),
    /// Unknown package name.
    #[error("Package '{0}' not found")]
    PackageNotFound(String),
    /// IO error carrying the offending path.
    #[error("IO on '{0}' failed with {1}")]
    Io(PathBuf, #[source] std::io::Error),
    /// Database or manifest parsing error.
    #[error("Parsing '{0}' failed with {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
    /// A compiler executable failed to start.
    #[error("Compiler failed to start: {0}")]
    CompilerStart(String),
    /// The compiler pool went away mid-build.
    #[error("Compiler pool closed during a build")]
    PoolClosed,
    /// Manifest write failure.
    #[error("Manifest write on '{0}' failed with {1}")]
    Manifest(PathBuf, #[source] std::io::Error),
}

mod database;
mod manifest;
mod package_builder;
mod project_builder;
mod target_builder;
mod target_view;

pub use database::{Database, Record, SourceRecord, TargetRecord};
pub use manifest::{ManifestResource, PackageManifest, MANIFEST_FILE_NAME};
pub use package_builder::{BuildCounts, BuildEvent, BuildSummary, PackageBuilder};
pub use project_builder::ProjectBuilder;
pub use target_view::{stable_stem, TargetView};
