//! The per-target build procedure.
//!
//! For one `(package, platform)` pair the builder enumerates source
//! files, resolves platform overrides, decides what needs rebuilding,
//! and ingests compiler results into the databases. It borrows the
//! [`TargetView`]'s databases for the duration of a run; dispatching and
//! event counting live in the package builder so the logic here is
//! purely about the build.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use kiln_project::{relative_to, Package, ResourcePath, GENERIC_PLATFORM};
use kiln_worker::protocol::BuildResult;
use petgraph::{algo, Graph};
use tracing::{debug, warn};

use crate::{
    database::{SourceRecord, TargetRecord},
    manifest::{ManifestResource, PackageManifest},
    target_view::TargetView,
    Error,
};

pub(crate) const SKIP_WRONG_PLATFORM: &str = "does not match build target";
pub(crate) const SKIP_OVERRIDDEN: &str = "overridden by platform-specific version";
pub(crate) const SKIP_UP_TO_DATE: &str = "up-to-date";

/// One source file that survived enumeration, ready for the rebuild
/// decision and dispatch.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub record: SourceRecord,
    pub source_path: PathBuf,
    pub target_path: PathBuf,
    /// Filled in at dispatch time, once the route resolved to a worker.
    pub compiler_name: String,
}

/// What one planning pass decided.
#[derive(Debug)]
pub(crate) struct BuildPlan {
    pub to_build: Vec<Candidate>,
    pub skipped: Vec<(Candidate, String)>,
}

pub(crate) struct TargetBuilder<'a> {
    package: &'a Package,
    view: &'a mut TargetView,
    platforms: &'a [String],
}

impl<'a> TargetBuilder<'a> {
    pub fn new(package: &'a Package, view: &'a mut TargetView, platforms: &'a [String]) -> Self {
        Self {
            package,
            view,
            platforms,
        }
    }

    /// Enumerates the package source tree, applies the platform override
    /// rules and the rebuild decision.
    pub fn plan(&mut self) -> Result<BuildPlan, Error> {
        let target_platform = self.view.platform().to_owned();
        let mut skipped = vec![];
        let mut order: Vec<String> = vec![];
        let mut by_name: HashMap<String, Candidate> = HashMap::new();

        for source_path in self.enumerate_sources()? {
            let candidate = self.make_candidate(&source_path)?;
            let platform = candidate.record.platform.clone();
            let name = candidate.record.resource_name.clone();

            if platform != GENERIC_PLATFORM && platform != target_platform {
                skipped.push((candidate, SKIP_WRONG_PLATFORM.to_owned()));
                continue;
            }
            if platform == GENERIC_PLATFORM
                && target_platform != GENERIC_PLATFORM
                && by_name
                    .get(&name)
                    .map_or(false, |existing| existing.record.platform != GENERIC_PLATFORM)
            {
                skipped.push((candidate, SKIP_OVERRIDDEN.to_owned()));
                continue;
            }
            if platform == target_platform {
                if let Some(existing) = by_name.get(&name) {
                    if existing.record.platform == GENERIC_PLATFORM {
                        skipped.push((existing.clone(), SKIP_OVERRIDDEN.to_owned()));
                    }
                }
            }

            if !by_name.contains_key(&name) {
                order.push(name.clone());
            }
            by_name.insert(name, candidate);
        }

        let mut to_build = vec![];
        for name in order {
            let Some(candidate) = by_name.remove(&name) else {
                continue;
            };
            if self.needs_rebuild(&candidate) {
                to_build.push(candidate);
            } else {
                skipped.push((candidate, SKIP_UP_TO_DATE.to_owned()));
            }
        }

        debug!(
            "planned {} build(s), {} skip(s) for '{}' on '{}'",
            to_build.len(),
            skipped.len(),
            self.package.name(),
            target_platform
        );
        Ok(BuildPlan { to_build, skipped })
    }

    /// Recursive walk of the package source directory, hidden names
    /// skipped, in stable order.
    fn enumerate_sources(&self) -> Result<Vec<PathBuf>, Error> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
            let entries = fs::read_dir(dir).map_err(|e| Error::Io(dir.to_owned(), e))?;
            for entry in entries.filter_map(Result::ok) {
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                let path = entry.path();
                if file_type.is_dir() {
                    walk(&path, out)?;
                } else if file_type.is_file() {
                    out.push(path);
                }
            }
            Ok(())
        }

        let mut files = vec![];
        walk(self.package.source_dir(), &mut files)?;
        files.sort();
        Ok(files)
    }

    /// A fresh source record for `source_path`, not yet inserted; the
    /// platform is the first property matching a recognized platform
    /// name.
    fn make_candidate(&self, source_path: &Path) -> Result<Candidate, Error> {
        let source_root = self.view.source_db().resource_root();
        let path = ResourcePath::parse(source_root, source_path).map_err(Error::Project)?;
        let platform = self.platform_of(&path.properties);

        let metadata =
            fs::metadata(source_path).map_err(|e| Error::Io(source_path.to_owned(), e))?;
        let write_time = metadata
            .modified()
            .map_err(|e| Error::Io(source_path.to_owned(), e))?;

        let target_path = self.view.target_path_for(&path.name);
        let record = SourceRecord {
            relative_path: path.relative_path,
            resource_name: path.name,
            resource_type: path.resource_type,
            properties: path.properties,
            platform,
            references: vec![],
            dependencies: vec![],
            write_time: write_time.into(),
            file_size: metadata.len(),
        };

        Ok(Candidate {
            record,
            source_path: source_path.to_owned(),
            target_path,
            compiler_name: String::new(),
        })
    }

    fn platform_of(&self, properties: &[String]) -> String {
        properties
            .iter()
            .find(|property| self.platforms.iter().any(|known| &known == property))
            .cloned()
            .unwrap_or_else(|| GENERIC_PLATFORM.to_owned())
    }

    /// The rebuild decision: build when the file is unknown, drifted,
    /// any transitive dependency is unprovable or drifted, or a declared
    /// output is gone.
    fn needs_rebuild(&self, candidate: &Candidate) -> bool {
        let Some(stored) = self.view.source_db().get(&candidate.record.relative_path) else {
            return true;
        };
        if stored.write_time != candidate.record.write_time
            || stored.file_size != candidate.record.file_size
        {
            return true;
        }
        if self.dependencies_modified(stored) {
            return true;
        }

        let Ok(target_key) = relative_to(self.view.target_dir(), &candidate.target_path) else {
            return true;
        };
        let Some(target) = self.view.target_db().get(&target_key) else {
            return true;
        };
        target
            .outputs
            .iter()
            .any(|output| !self.view.target_dir().join(output).exists())
    }

    /// Walks the stored dependency graph transitively. Any dependency
    /// missing from the database, missing on disk, or with a drifted
    /// write time or size makes the record stale; so does a dependency
    /// cycle, which cannot be proven fresh.
    fn dependencies_modified(&self, stored: &SourceRecord) -> bool {
        let source_db = self.view.source_db();
        let source_root = source_db.resource_root();

        let mut graph = Graph::<(), ()>::new();
        let mut indices: HashMap<&str, petgraph::prelude::NodeIndex> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        let root_key = stored.relative_path.as_str();
        indices.insert(root_key, graph.add_node(()));
        queue.push_back(root_key);

        while let Some(key) = queue.pop_front() {
            // unknown records cannot be traversed; they fail the
            // per-dependency check below instead.
            let Some(record) = source_db.get(key) else {
                continue;
            };
            let from = indices[key];
            for dependency in &record.dependencies {
                let to = match indices.get(dependency.as_str()) {
                    Some(&index) => index,
                    None => {
                        let index = graph.add_node(());
                        indices.insert(dependency, index);
                        queue.push_back(dependency);
                        index
                    }
                };
                graph.update_edge(from, to, ());
            }
        }

        if algo::toposort(&graph, None).is_err() {
            warn!("dependency cycle under '{}', forcing rebuild", root_key);
            return true;
        }

        for &key in indices.keys().filter(|&&key| key != root_key) {
            let Some(record) = source_db.get(key) else {
                return true;
            };
            let abs_path = source_root.join(key);
            let Ok(metadata) = fs::metadata(&abs_path) else {
                return true;
            };
            let Ok(modified) = metadata.modified() else {
                return true;
            };
            if DateTime::<Utc>::from(modified) != record.write_time
                || metadata.len() != record.file_size
            {
                return true;
            }
        }
        false
    }

    /// Ingests one successful build result: the source record is
    /// inserted, each reported reference is upserted and cross-linked
    /// both ways, and the target record receives the relativized
    /// outputs. Failed results never reach this point.
    pub fn ingest(&mut self, candidate: Candidate, result: &BuildResult) -> Result<(), Error> {
        let source_key = candidate.record.relative_path.clone();
        self.view.source_db_mut().insert(candidate.record);

        for reference in &result.references {
            let source_root = self.view.source_db().resource_root();
            let Ok(reference_key) = relative_to(source_root, reference) else {
                warn!(
                    "reference '{}' is outside the package, ignored",
                    reference.display()
                );
                continue;
            };

            let mut referenced = match self.view.source_db().get(&reference_key) {
                Some(existing) => existing.clone(),
                None => self.referenced_record(reference_key.clone()),
            };
            // the referenced file's disk state is what future rebuild
            // decisions compare against.
            if let Ok(metadata) = fs::metadata(reference) {
                if let Ok(modified) = metadata.modified() {
                    referenced.write_time = modified.into();
                }
                referenced.file_size = metadata.len();
            }
            self.view.source_db_mut().insert(referenced);

            self.view
                .source_db_mut()
                .add_reference(&reference_key, &candidate.source_path)?;
            self.view
                .source_db_mut()
                .add_dependency(&source_key, reference)?;
        }

        let target_key = relative_to(self.view.target_dir(), &candidate.target_path)
            .map_err(Error::Project)?;
        let mut outputs: Vec<String> = vec![];
        for output in &result.outputs {
            match relative_to(self.view.target_dir(), output) {
                Ok(relative) => {
                    if !outputs.contains(&relative) {
                        outputs.push(relative);
                    }
                }
                Err(_) => warn!(
                    "output '{}' is outside the target directory, ignored",
                    output.display()
                ),
            }
        }

        let platform = self.view.platform().to_owned();
        self.view.target_db_mut().insert(TargetRecord {
            relative_path: target_key,
            source_path: source_key,
            platform,
            compiler_name: candidate.compiler_name,
            outputs,
        });
        Ok(())
    }

    /// A record for a referenced file seen for the first time; write
    /// time and size are refreshed from disk by the caller.
    fn referenced_record(&self, relative_path: String) -> SourceRecord {
        let path = ResourcePath::from_relative(relative_path);
        let platform = self.platform_of(&path.properties);
        SourceRecord {
            relative_path: path.relative_path,
            resource_name: path.name,
            resource_type: path.resource_type,
            properties: path.properties,
            platform,
            references: vec![],
            dependencies: vec![],
            write_time: DateTime::<Utc>::from(SystemTime::UNIX_EPOCH),
            file_size: 0,
        }
    }

    /// Writes the package manifest unless an existing one is still
    /// accurate: nothing was built and neither database was dirtied.
    pub fn write_manifest(
        &self,
        project_name: &str,
        databases_dirty: bool,
        built_any: bool,
    ) -> Result<Option<PathBuf>, Error> {
        let path = self.view.manifest_path();
        if path.exists() && !databases_dirty && !built_any {
            debug!("manifest '{}' left untouched", path.display());
            return Ok(None);
        }

        let mut resources: Vec<ManifestResource> = self
            .view
            .target_db()
            .entries()
            .iter()
            .map(|target| {
                let (name, kind, tags) = match self.view.source_db().get(&target.source_path) {
                    Some(source) => (
                        source.resource_name.clone(),
                        source.resource_type.clone(),
                        source.properties.clone(),
                    ),
                    None => {
                        let parsed = ResourcePath::from_relative(target.source_path.clone());
                        (parsed.name, parsed.resource_type, parsed.properties)
                    }
                };
                ManifestResource {
                    name,
                    kind,
                    tags,
                    data: target.outputs.clone(),
                }
            })
            .collect();
        resources.sort_by(|a, b| a.name.cmp(&b.name));

        let manifest = PackageManifest {
            project_name: project_name.to_owned(),
            package_name: self.view.package_name().to_owned(),
            build_date: Utc::now(),
            platform: self.view.platform().to_owned(),
            resources,
        };
        manifest.write(&path)?;
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use kiln_project::Project;

    use super::{TargetBuilder, SKIP_OVERRIDDEN, SKIP_UP_TO_DATE, SKIP_WRONG_PLATFORM};
    use crate::target_view::TargetView;

    fn platforms() -> Vec<String> {
        vec!["ps3".to_owned(), "win32".to_owned()]
    }

    fn project_with(files: &[(&str, &str)]) -> (tempfile::TempDir, Project) {
        let work_dir = tempfile::tempdir().unwrap();
        let root = work_dir.path().join("game");
        for (relative, content) in files {
            let path = root.join("packages/bundle.source").join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let project = Project::open(&root).unwrap();
        (work_dir, project)
    }

    #[test]
    fn platform_specific_overrides_generic() {
        let (_work_dir, project) = project_with(&[
            ("tex/brick.texture", "generic"),
            ("tex/brick.ps3.texture", "ps3"),
        ]);
        let package = project.package("bundle").unwrap();
        let mut view = TargetView::new(package, project.database_dir(), "ps3").unwrap();
        let platforms = platforms();
        let mut builder = TargetBuilder::new(package, &mut view, &platforms);

        let plan = builder.plan().unwrap();
        assert_eq!(plan.to_build.len(), 1);
        assert_eq!(plan.to_build[0].record.resource_name, "tex/brick");
        assert_eq!(plan.to_build[0].record.platform, "ps3");

        assert_eq!(plan.skipped.len(), 1);
        let (skipped, reason) = &plan.skipped[0];
        assert_eq!(skipped.record.relative_path, "tex/brick.texture");
        assert_eq!(reason, SKIP_OVERRIDDEN);
    }

    #[test]
    fn foreign_platform_does_not_match_build_target() {
        let (_work_dir, project) = project_with(&[("tex/brick.ps3.texture", "ps3")]);
        let package = project.package("bundle").unwrap();
        let mut view = TargetView::new(package, project.database_dir(), "win32").unwrap();
        let platforms = platforms();
        let mut builder = TargetBuilder::new(package, &mut view, &platforms);

        let plan = builder.plan().unwrap();
        assert!(plan.to_build.is_empty());
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].1, SKIP_WRONG_PLATFORM);
    }

    #[test]
    fn generic_seen_first_is_displaced_by_specific() {
        // "brick.hq.texture" sorts before "brick.ps3.texture" and its
        // property is not a platform, so the generic flavor enters the
        // override map first.
        let (_work_dir, project) = project_with(&[
            ("brick.hq.texture", "generic"),
            ("brick.ps3.texture", "ps3"),
        ]);
        let package = project.package("bundle").unwrap();
        let mut view = TargetView::new(package, project.database_dir(), "ps3").unwrap();
        let platforms = platforms();
        let mut builder = TargetBuilder::new(package, &mut view, &platforms);

        let plan = builder.plan().unwrap();
        assert_eq!(plan.to_build.len(), 1);
        assert_eq!(plan.to_build[0].record.relative_path, "brick.ps3.texture");
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].0.record.relative_path, "brick.hq.texture");
        assert_eq!(plan.skipped[0].1, SKIP_OVERRIDDEN);
    }

    #[test]
    fn hidden_files_are_not_enumerated() {
        let (_work_dir, project) = project_with(&[
            ("visible.txt", "data"),
            (".hidden.txt", "data"),
            (".git/objects/blob.txt", "data"),
        ]);
        let package = project.package("bundle").unwrap();
        let mut view = TargetView::new(package, project.database_dir(), "").unwrap();
        let platforms = platforms();
        let mut builder = TargetBuilder::new(package, &mut view, &platforms);

        let plan = builder.plan().unwrap();
        assert_eq!(plan.to_build.len(), 1);
        assert_eq!(plan.to_build[0].record.relative_path, "visible.txt");
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn unknown_file_needs_rebuild_and_cycle_forces_rebuild() {
        use crate::database::TargetRecord;
        use crate::target_view::stable_stem;

        let (_work_dir, project) = project_with(&[("a.txt", "a"), ("b.txt", "b")]);
        let package = project.package("bundle").unwrap();
        let mut view = TargetView::new(package, project.database_dir(), "").unwrap();
        let platforms = platforms();

        // first plan: everything is new.
        let candidates = {
            let mut builder = TargetBuilder::new(package, &mut view, &platforms);
            let plan = builder.plan().unwrap();
            assert_eq!(plan.to_build.len(), 2);
            plan.to_build
        };

        // store records and present outputs: everything is up-to-date.
        for candidate in &candidates {
            let stem = stable_stem(&candidate.record.resource_name);
            let output = format!("{stem}.out");
            fs::write(view.target_dir().join(&output), b"built").unwrap();
            view.source_db_mut().insert(candidate.record.clone());
            view.target_db_mut().insert(TargetRecord {
                relative_path: stem,
                source_path: candidate.record.relative_path.clone(),
                platform: "generic".to_owned(),
                compiler_name: "compiler-copy".to_owned(),
                outputs: vec![output],
            });
        }
        {
            let mut builder = TargetBuilder::new(package, &mut view, &platforms);
            let plan = builder.plan().unwrap();
            assert!(plan.to_build.is_empty());
            assert!(plan
                .skipped
                .iter()
                .all(|(_, reason)| reason == SKIP_UP_TO_DATE));
        }

        // a dependency cycle between the two records cannot be proven
        // fresh; the traversal must terminate and decide to rebuild.
        for candidate in &candidates {
            let mut record = candidate.record.clone();
            record.dependencies = if record.relative_path == "a.txt" {
                vec!["b.txt".to_owned()]
            } else {
                vec!["a.txt".to_owned()]
            };
            view.source_db_mut().insert(record);
        }
        let mut builder = TargetBuilder::new(package, &mut view, &platforms);
        let plan = builder.plan().unwrap();
        assert_eq!(plan.to_build.len(), 2);
        assert!(!plan
            .skipped
            .iter()
            .any(|(_, reason)| reason == SKIP_UP_TO_DATE));
    }
}
