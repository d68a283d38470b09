//! The per-package build driver.
//!
//! The package builder owns the run counters and the public event
//! surface. It plans each of the package's platform targets through a
//! [`TargetBuilder`], dispatches the work to the compiler pool, ingests
//! completions, and finishes a target by saving its databases and
//! (re)writing the manifest.

use std::{collections::HashMap, path::PathBuf};

use kiln_project::Package;
use kiln_worker::pool::{CompileJob, CompilerPool, PoolEvent};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    target_builder::{Candidate, TargetBuilder},
    target_view::TargetView,
    Error,
};

/// Counters of one build run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildCounts {
    /// Jobs handed to the pool whose outcome is still expected.
    pub expected: usize,
    /// Failed builds, lost jobs and manifest failures.
    pub errors: usize,
    /// Successful builds ingested into the databases.
    pub succeeded: usize,
    /// Sources skipped by override rules, freshness or missing routes.
    pub skipped: usize,
}

/// The public build event surface.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    /// A target run began.
    Start {
        /// Package being built.
        package: String,
        /// Platform being built for.
        platform: String,
    },
    /// A worker began compiling a source file.
    Compile {
        /// Absolute source path.
        source: PathBuf,
    },
    /// A source file was built and ingested.
    Success {
        /// Absolute source path.
        source: PathBuf,
        /// Number of produced output files.
        outputs: usize,
    },
    /// A source file was deliberately not built.
    Ignore {
        /// Absolute source path.
        source: PathBuf,
        /// Why it was skipped.
        reason: String,
    },
    /// A source file failed to build.
    Error {
        /// Absolute source path.
        source: PathBuf,
        /// Worker-reported or engine-side error strings.
        errors: Vec<String>,
    },
    /// A target run ended.
    Finish {
        /// Package that was built.
        package: String,
        /// Platform that was built for.
        platform: String,
        /// Final counters.
        counts: BuildCounts,
        /// `errors == 0`.
        success: bool,
    },
}

/// Aggregate outcome of a build.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildSummary {
    /// Counters summed over all built targets.
    pub counts: BuildCounts,
    /// Whether every target finished without errors.
    pub success: bool,
}

/// Builds one package, target by target.
pub struct PackageBuilder<'a> {
    project_name: String,
    package: Package,
    platforms: Vec<String>,
    database_dir: PathBuf,
    pool: &'a mut CompilerPool,
    events: Option<mpsc::UnboundedSender<BuildEvent>>,
}

impl<'a> PackageBuilder<'a> {
    pub(crate) fn new(
        project_name: String,
        package: Package,
        platforms: Vec<String>,
        database_dir: PathBuf,
        pool: &'a mut CompilerPool,
    ) -> Self {
        Self {
            project_name,
            package,
            platforms,
            database_dir,
            pool,
            events: None,
        }
    }

    /// Streams build events to `events` in addition to driving the build.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<BuildEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: BuildEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Builds every enumerated platform target of the package.
    pub async fn build(&mut self) -> Result<BuildSummary, Error> {
        let platforms = self.package.targets().to_vec();
        let mut summary = BuildSummary {
            counts: BuildCounts::default(),
            success: true,
        };
        for platform in platforms {
            let target = self.build_target(&platform).await?;
            summary.counts.expected += target.counts.expected;
            summary.counts.errors += target.counts.errors;
            summary.counts.succeeded += target.counts.succeeded;
            summary.counts.skipped += target.counts.skipped;
            summary.success &= target.success;
        }
        Ok(summary)
    }

    /// Builds one platform target of the package.
    pub async fn build_target(&mut self, platform: &str) -> Result<BuildSummary, Error> {
        let mut view = TargetView::new(&self.package, &self.database_dir, platform)?;
        let platform = view.platform().to_owned();
        let mut counts = BuildCounts::default();

        self.emit(BuildEvent::Start {
            package: self.package.name().to_owned(),
            platform: platform.clone(),
        });

        let mut builder = TargetBuilder::new(&self.package, &mut view, &self.platforms);
        let plan = builder.plan()?;

        for (candidate, reason) in plan.skipped {
            counts.skipped += 1;
            self.emit(BuildEvent::Ignore {
                source: candidate.source_path,
                reason,
            });
        }

        counts.expected = plan.to_build.len();
        let mut expected = plan.to_build.len();
        let mut built_any = false;
        let mut pending: HashMap<PathBuf, Candidate> = HashMap::new();

        for mut candidate in plan.to_build {
            candidate.compiler_name = self
                .pool
                .find_compiler(&candidate.record.resource_type, &candidate.record.platform)
                .and_then(|id| self.pool.worker_executable(id))
                .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
                .unwrap_or_default();

            let job = CompileJob {
                source_path: candidate.source_path.clone(),
                target_path: candidate.target_path.clone(),
                resource_type: candidate.record.resource_type.clone(),
                platform: candidate.record.platform.clone(),
            };
            pending.insert(candidate.source_path.clone(), candidate);
            self.pool.submit(job);
        }

        // the run concludes when every expected outcome arrived; an
        // empty plan concludes immediately without touching the pool.
        while expected > 0 {
            let Some(event) = self.pool.next_event().await else {
                return Err(Error::PoolClosed);
            };
            match event {
                PoolEvent::Started { job } => {
                    self.emit(BuildEvent::Compile {
                        source: job.source_path,
                    });
                }
                PoolEvent::Complete { job, result } => {
                    let Some(candidate) = pending.remove(&job.source_path) else {
                        warn!(
                            "completion for unknown source '{}'",
                            job.source_path.display()
                        );
                        continue;
                    };
                    expected -= 1;
                    built_any = true;
                    if result.success {
                        let outputs = result.outputs.len();
                        builder.ingest(candidate, &result)?;
                        counts.succeeded += 1;
                        self.emit(BuildEvent::Success {
                            source: job.source_path,
                            outputs,
                        });
                    } else {
                        counts.errors += 1;
                        self.emit(BuildEvent::Error {
                            source: job.source_path,
                            errors: result.errors,
                        });
                    }
                }
                PoolEvent::Skipped { job, reason } => {
                    if pending.remove(&job.source_path).is_some() {
                        expected -= 1;
                    }
                    counts.skipped += 1;
                    self.emit(BuildEvent::Ignore {
                        source: job.source_path,
                        reason,
                    });
                }
                PoolEvent::Exited { lost } => {
                    for job in lost {
                        if pending.remove(&job.source_path).is_some() {
                            expected -= 1;
                            counts.errors += 1;
                            self.emit(BuildEvent::Error {
                                source: job.source_path,
                                errors: vec!["worker exited before answering".to_owned()],
                            });
                        }
                    }
                }
                PoolEvent::Error { message } => {
                    warn!("compiler pool error during build: {message}");
                }
                PoolEvent::Ready | PoolEvent::Terminated => {}
            }
        }

        // the manifest freshness check must see the pre-save dirty state.
        let databases_dirty = view.source_db().dirty() || view.target_db().dirty();
        let builder = TargetBuilder::new(&self.package, &mut view, &self.platforms);
        match builder.write_manifest(&self.project_name, databases_dirty, built_any) {
            Ok(Some(path)) => info!("manifest written to '{}'", path.display()),
            Ok(None) => {}
            Err(e) => {
                counts.errors += 1;
                self.emit(BuildEvent::Error {
                    source: view.manifest_path(),
                    errors: vec![e.to_string()],
                });
            }
        }
        view.save_if_dirty()?;

        let success = counts.errors == 0;
        self.emit(BuildEvent::Finish {
            package: self.package.name().to_owned(),
            platform,
            counts,
            success,
        });
        Ok(BuildSummary { counts, success })
    }
}
