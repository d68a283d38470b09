//! The persisted source and target databases.
//!
//! A database is a flat list of records plus a side index from primary
//! key (the record's package-relative path) to list position. It is
//! serialized as pretty JSON with records sorted by key, so two
//! identical builds produce byte-identical files. A dirty flag is set by
//! every mutation and cleared by a successful save.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use kiln_project::relative_to;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::Error;

/// A database entry with a primary key.
pub trait Record: Clone + Serialize + DeserializeOwned {
    /// The package-relative primary key.
    fn key(&self) -> &str;
}

/// One input file under a package.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    /// Primary key, relative to the package source root.
    pub relative_path: String,
    /// Path without any extensions.
    pub resource_name: String,
    /// The final extension.
    pub resource_type: String,
    /// Dot-separated extensions between name and type, in order.
    pub properties: Vec<String>,
    /// Platform this file is specific to; `"generic"` otherwise.
    pub platform: String,
    /// Relative paths of files that point at this one.
    pub references: Vec<String>,
    /// Relative paths this file depends on.
    pub dependencies: Vec<String>,
    /// Filesystem write time at the last successful build.
    pub write_time: DateTime<Utc>,
    /// File size in bytes at the last successful build.
    pub file_size: u64,
}

impl Record for SourceRecord {
    fn key(&self) -> &str {
        &self.relative_path
    }
}

/// One build output grouping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetRecord {
    /// Primary key, the stable stem derived from the source's name.
    pub relative_path: String,
    /// Key of the source record this output came from.
    pub source_path: String,
    /// Platform the output was built for.
    pub platform: String,
    /// Name of the compiler that produced the output.
    pub compiler_name: String,
    /// Output files relative to the target directory, primary first,
    /// duplicates suppressed.
    pub outputs: Vec<String>,
}

impl Record for TargetRecord {
    fn key(&self) -> &str {
        &self.relative_path
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentRef<'a, T> {
    bundle_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform: Option<&'a str>,
    entries: &'a [T],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document<T> {
    bundle_name: String,
    #[serde(default)]
    platform: Option<String>,
    entries: Vec<T>,
}

/// A persisted set of records with unique primary keys.
#[derive(Debug)]
pub struct Database<T> {
    bundle_name: String,
    platform: Option<String>,
    resource_root: PathBuf,
    entries: Vec<T>,
    index: HashMap<String, usize>,
    dirty: bool,
}

impl<T: Record> Database<T> {
    /// An empty database, born dirty so a fresh one gets saved.
    pub fn new(bundle_name: &str, platform: Option<&str>, resource_root: &Path) -> Self {
        Self {
            bundle_name: bundle_name.to_owned(),
            platform: platform.map(str::to_owned),
            resource_root: resource_root.to_owned(),
            entries: vec![],
            index: HashMap::new(),
            dirty: true,
        }
    }

    /// Loads `path`, replacing all state. A missing file yields an empty,
    /// dirty database; a corrupt one is an error for the caller.
    pub fn load(
        path: &Path,
        bundle_name: &str,
        platform: Option<&str>,
        resource_root: &Path,
    ) -> Result<Self, Error> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no database at '{}', starting empty", path.display());
                return Ok(Self::new(bundle_name, platform, resource_root));
            }
            Err(e) => return Err(Error::Io(path.to_owned(), e)),
        };
        let document: Document<T> =
            serde_json::from_slice(&bytes).map_err(|e| Error::Parse(path.to_owned(), e))?;

        let mut database = Self {
            bundle_name: document.bundle_name,
            platform: document.platform,
            resource_root: resource_root.to_owned(),
            entries: document.entries,
            index: HashMap::new(),
            dirty: false,
        };
        database.rebuild_index();
        Ok(database)
    }

    /// Saves to `path` with entries sorted by key, then clears the dirty
    /// flag. The document is written to a sibling file first and renamed
    /// into place so a crash cannot leave a truncated database behind.
    pub fn save(&mut self, path: &Path) -> Result<(), Error> {
        self.entries.sort_by(|a, b| a.key().cmp(b.key()));
        self.rebuild_index();

        let document = DocumentRef {
            bundle_name: &self.bundle_name,
            platform: self.platform.as_deref(),
            entries: &self.entries,
        };
        let mut bytes =
            serde_json::to_vec_pretty(&document).map_err(|e| Error::Parse(path.to_owned(), e))?;
        bytes.push(b'\n');

        let staging = path.with_extension("json.part");
        fs::write(&staging, &bytes).map_err(|e| Error::Io(staging.clone(), e))?;
        fs::rename(&staging, path).map_err(|e| Error::Io(path.to_owned(), e))?;

        self.dirty = false;
        Ok(())
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.key().to_owned(), position))
            .collect();
    }

    /// Whether unsaved mutations exist.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// The package name this database belongs to.
    pub fn bundle_name(&self) -> &str {
        &self.bundle_name
    }

    /// The absolute root its relative paths resolve against.
    pub fn resource_root(&self) -> &Path {
        &self.resource_root
    }

    /// All records, in storage order.
    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    /// Record count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no records exist.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks a record up by primary key.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.index.get(key).map(|&position| &self.entries[position])
    }

    /// Looks a record up by absolute path.
    pub fn query(&self, abs_path: &Path) -> Option<&T> {
        let key = relative_to(&self.resource_root, abs_path).ok()?;
        self.get(&key)
    }

    /// Inserts `entry`, overwriting any record with the same key, and
    /// sets the dirty flag.
    pub fn insert(&mut self, entry: T) {
        match self.index.get(entry.key()) {
            Some(&position) => self.entries[position] = entry,
            None => {
                self.index.insert(entry.key().to_owned(), self.entries.len());
                self.entries.push(entry);
            }
        }
        self.dirty = true;
    }

    /// Removes the record stored for `abs_path`, setting the dirty flag
    /// when one existed.
    pub fn remove(&mut self, abs_path: &Path) -> Option<T> {
        let key = relative_to(&self.resource_root, abs_path).ok()?;
        let position = self.index.remove(&key)?;
        let entry = self.entries.remove(position);
        self.rebuild_index();
        self.dirty = true;
        Some(entry)
    }
}

impl Database<SourceRecord> {
    /// Appends `abs_path` (relativized) to `key`'s reference list iff
    /// not already present.
    pub fn add_reference(&mut self, key: &str, abs_path: &Path) -> Result<(), Error> {
        let reference = relative_to(&self.resource_root, abs_path).map_err(Error::Project)?;
        if let Some(&position) = self.index.get(key) {
            let entry = &mut self.entries[position];
            if !entry.references.contains(&reference) {
                entry.references.push(reference);
                self.dirty = true;
            }
        }
        Ok(())
    }

    /// Appends `abs_path` (relativized) to `key`'s dependency list iff
    /// not already present.
    pub fn add_dependency(&mut self, key: &str, abs_path: &Path) -> Result<(), Error> {
        let dependency = relative_to(&self.resource_root, abs_path).map_err(Error::Project)?;
        if let Some(&position) = self.index.get(key) {
            let entry = &mut self.entries[position];
            if !entry.dependencies.contains(&dependency) {
                entry.dependencies.push(dependency);
                self.dirty = true;
            }
        }
        Ok(())
    }
}
