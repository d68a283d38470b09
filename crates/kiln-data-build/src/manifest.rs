//! The per-target package manifest.
//!
//! `package.manifest` sits in each target directory and describes every
//! built resource and its output files so a runtime can load them
//! without consulting the databases. Paths in `data` are relative to the
//! target directory.

use std::{fs, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// File name of the manifest inside a target directory.
pub const MANIFEST_FILE_NAME: &str = "package.manifest";

/// One built resource in the manifest.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestResource {
    /// Resource name, directories included.
    pub name: String,
    /// Resource type, the source's final extension.
    #[serde(rename = "type")]
    pub kind: String,
    /// The source's property list.
    pub tags: Vec<String>,
    /// Output files relative to the target directory, primary first.
    pub data: Vec<String>,
}

/// The manifest document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Name of the owning project.
    pub project_name: String,
    /// Name of the package.
    pub package_name: String,
    /// When this manifest was produced.
    pub build_date: DateTime<Utc>,
    /// Platform of the target directory.
    pub platform: String,
    /// All built resources, sorted by name for stable output.
    pub resources: Vec<ManifestResource>,
}

impl PackageManifest {
    /// Reads a manifest file.
    pub fn read(path: &Path) -> Result<Self, Error> {
        let bytes = fs::read(path).map_err(|e| Error::Io(path.to_owned(), e))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Parse(path.to_owned(), e))
    }

    /// Writes the manifest as pretty JSON, staged and renamed into place.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let mut bytes = serde_json::to_vec_pretty(self).map_err(|e| Error::Parse(path.to_owned(), e))?;
        bytes.push(b'\n');

        let staging = path.with_extension("manifest.part");
        fs::write(&staging, &bytes).map_err(|e| Error::Manifest(staging.clone(), e))?;
        fs::rename(&staging, path).map_err(|e| Error::Manifest(path.to_owned(), e))?;
        Ok(())
    }
}
