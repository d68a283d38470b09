//! The project-level entry point.
//!
//! The project builder loads a [`Project`], brings the compiler pool up
//! from its pipeline definition with executables resolved under
//! `processors/`, and hands out one [`PackageBuilder`] per package.
//! Disposal requests pool shutdown and returns once the last worker
//! exited.

use std::path::Path;

use kiln_project::Project;
use kiln_worker::pool::{CompilerPool, PoolEvent};
use tracing::{info, warn};

use crate::{package_builder::PackageBuilder, Error};

/// Owns the project model and the compiler pool of one build session.
pub struct ProjectBuilder {
    project: Project,
    pool: CompilerPool,
}

impl ProjectBuilder {
    /// Opens the project at `root` and starts its compiler pool,
    /// returning once every worker reported in. A worker that cannot be
    /// spawned fails the whole session.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let project = Project::open(root)?;

        let mut pool = CompilerPool::new();
        pool.startup(project.processors_dir(), project.pipeline());
        loop {
            match pool.next_event().await {
                Some(PoolEvent::Ready) => break,
                Some(PoolEvent::Error { message }) => {
                    return Err(Error::CompilerStart(message));
                }
                Some(event) => warn!("unexpected pool event during startup: {event:?}"),
                None => return Err(Error::PoolClosed),
            }
        }

        info!(
            "compiler pool ready, {} worker(s) for project '{}'",
            pool.worker_count(),
            project.name()
        );
        Ok(Self { project, pool })
    }

    /// The loaded project model.
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// A builder for one of the project's packages.
    pub fn package_builder(&mut self, package_name: &str) -> Result<PackageBuilder<'_>, Error> {
        let package = self
            .project
            .package(package_name)
            .ok_or_else(|| Error::PackageNotFound(package_name.to_owned()))?
            .clone();
        Ok(PackageBuilder::new(
            self.project.name().to_owned(),
            package,
            self.project.platforms().to_vec(),
            self.project.database_dir().to_owned(),
            &mut self.pool,
        ))
    }

    /// Names of all enumerated packages.
    pub fn package_names(&self) -> Vec<String> {
        self.project.packages().keys().cloned().collect()
    }

    /// Tears the compiler pool down, returning once the last worker
    /// exited.
    pub async fn dispose(mut self) -> Result<(), Error> {
        self.pool.shutdown();
        loop {
            match self.pool.next_event().await {
                Some(PoolEvent::Terminated) | None => break,
                Some(_) => {}
            }
        }
        info!("project '{}' disposed", self.project.name());
        Ok(())
    }
}
