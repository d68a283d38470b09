use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use tracing::info;

use crate::{
    pipeline::{load_platform_names, Pipeline},
    Error,
};

/// Name of the platform-agnostic target flavor.
pub const GENERIC_PLATFORM: &str = "generic";

const SOURCE_SUFFIX: &str = ".source";
const TARGET_SUFFIX: &str = ".target";

/// Normalizes a platform name: the empty string denotes the generic
/// platform.
pub fn normalize_platform(platform: &str) -> &str {
    if platform.is_empty() {
        GENERIC_PLATFORM
    } else {
        platform
    }
}

/// A project directory: packages, build databases, compiler executables
/// and the pipeline/platform configuration.
#[derive(Debug)]
pub struct Project {
    name: String,
    root_path: PathBuf,
    packages_dir: PathBuf,
    database_dir: PathBuf,
    processors_dir: PathBuf,
    pipeline: Pipeline,
    platforms: Vec<String>,
    packages: BTreeMap<String, Package>,
}

impl Project {
    /// Opens the project at `root`, creating the `packages/`, `database/`
    /// and `processors/` directories when absent, and enumerates its
    /// packages.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root_path = root.as_ref().to_owned();
        let name = root_path
            .file_name()
            .map_or_else(|| "project".to_owned(), |n| n.to_string_lossy().into_owned());

        let packages_dir = root_path.join("packages");
        let database_dir = root_path.join("database");
        let processors_dir = root_path.join("processors");
        for dir in [&packages_dir, &database_dir, &processors_dir] {
            fs::create_dir_all(dir).map_err(|e| Error::Io(dir.clone(), e))?;
        }

        let pipeline = Pipeline::from_file(&root_path.join("pipeline.json"))?;
        let platforms = load_platform_names(&root_path.join("platform.json"))?;
        let packages = Self::scan_packages(&packages_dir)?;

        info!(
            "opened project '{}' with {} package(s)",
            name,
            packages.len()
        );

        Ok(Self {
            name,
            root_path,
            packages_dir,
            database_dir,
            processors_dir,
            pipeline,
            platforms,
            packages,
        })
    }

    fn scan_packages(packages_dir: &Path) -> Result<BTreeMap<String, Package>, Error> {
        let mut packages = BTreeMap::new();
        let entries =
            fs::read_dir(packages_dir).map_err(|e| Error::Io(packages_dir.to_owned(), e))?;
        for entry in entries.filter_map(Result::ok) {
            if !entry.path().is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(stem) = file_name.strip_suffix(SOURCE_SUFFIX) {
                if !stem.is_empty() {
                    packages.insert(stem.to_owned(), Package::open(packages_dir, stem)?);
                }
            }
        }
        Ok(packages)
    }

    /// Project name, taken from the root directory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute project root.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Directory holding the source and target databases.
    pub fn database_dir(&self) -> &Path {
        &self.database_dir
    }

    /// Directory compiler executables are resolved under.
    pub fn processors_dir(&self) -> &Path {
        &self.processors_dir
    }

    /// The pipeline definition, route key to compiler launch.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Recognized platform names.
    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Enumerated packages, keyed by name.
    pub fn packages(&self) -> &BTreeMap<String, Package> {
        &self.packages
    }

    /// Looks up a package by name.
    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }
}

/// One `<name>.source/` package directory and its enumerated platform
/// targets.
#[derive(Debug, Clone)]
pub struct Package {
    name: String,
    packages_dir: PathBuf,
    source_dir: PathBuf,
    targets: Vec<String>,
}

impl Package {
    pub(crate) fn open(packages_dir: &Path, name: &str) -> Result<Self, Error> {
        let source_dir = packages_dir.join(format!("{name}{SOURCE_SUFFIX}"));
        fs::create_dir_all(&source_dir).map_err(|e| Error::Io(source_dir.clone(), e))?;
        let targets = Self::scan_targets(packages_dir, name)?;
        Ok(Self {
            name: name.to_owned(),
            packages_dir: packages_dir.to_owned(),
            source_dir,
            targets,
        })
    }

    /// Enumerates `<name>.target` and `<name>.<platform>.target`
    /// directories next to the package's source directory.
    fn scan_targets(packages_dir: &Path, name: &str) -> Result<Vec<String>, Error> {
        let mut targets = vec![];
        let entries =
            fs::read_dir(packages_dir).map_err(|e| Error::Io(packages_dir.to_owned(), e))?;
        for entry in entries.filter_map(Result::ok) {
            if !entry.path().is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(stem) = file_name.strip_suffix(TARGET_SUFFIX) else {
                continue;
            };
            if stem == name {
                targets.push(GENERIC_PLATFORM.to_owned());
            } else if let Some(platform) = stem.strip_prefix(name).and_then(|s| s.strip_prefix('.'))
            {
                if !platform.is_empty() {
                    targets.push(normalize_platform(platform).to_owned());
                }
            }
        }
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    /// Package name (the `.source` directory stem).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The package's source tree root.
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Platform names this package is targeted at.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// The target directory for `platform`, whether or not it exists yet.
    pub fn target_dir(&self, platform: &str) -> PathBuf {
        self.packages_dir.join(format!(
            "{}.{}{TARGET_SUFFIX}",
            self.name,
            normalize_platform(platform)
        ))
    }
}
