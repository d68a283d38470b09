use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Error;

/// Launch description of one compiler executable, one entry of
/// `pipeline.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompilerLaunch {
    /// Executable path; resolved under the project's `processors/`
    /// directory when relative.
    pub path: PathBuf,
    /// Command-line arguments.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Working directory for the child; inherited when absent.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Environment variables added to the child environment.
    #[serde(default)]
    pub extra_environment: BTreeMap<String, String>,
    /// Environment variables removed from the inherited environment.
    #[serde(default)]
    pub hide_environment: Vec<String>,
    /// Restart cap after unexpected exits; 0 restarts forever.
    #[serde(default)]
    pub max_restart_count: u32,
    /// Silences the child's stderr instead of inheriting it.
    #[serde(default)]
    pub suppress_stdio: bool,
}

/// The `pipeline.json` document: route key (`<type>` or
/// `<type>.<platform>`) to compiler launch description.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Pipeline {
    /// Routes in stable order.
    pub routes: BTreeMap<String, CompilerLaunch>,
}

impl Pipeline {
    /// Reads a pipeline definition; a missing file yields an empty
    /// pipeline (every build request will then skip with "no compiler").
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        match fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| Error::Parse(path.to_owned(), e))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no pipeline definition at '{}'", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(path.to_owned(), e)),
        }
    }
}

/// Reads the `platform.json` list of recognized platform names; a missing
/// file yields the generic platform only.
pub fn load_platform_names(path: &Path) -> Result<Vec<String>, Error> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::Parse(path.to_owned(), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no platform list at '{}'", path.display());
            Ok(vec![crate::GENERIC_PLATFORM.to_owned()])
        }
        Err(e) => Err(Error::Io(path.to_owned(), e)),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{load_platform_names, Pipeline};

    #[test]
    fn routes_parse_with_defaults() {
        let work_dir = tempfile::tempdir().unwrap();
        let path = work_dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            r#"{
                "texture": { "path": "texc", "maxRestartCount": 2 },
                "mesh.ps3": {
                    "path": "/opt/meshc",
                    "arguments": ["--fast"],
                    "extraEnvironment": { "MESHC_CACHE": "1" },
                    "hideEnvironment": ["TMPDIR"],
                    "suppressStdio": true
                }
            }"#,
        )
        .unwrap();

        let pipeline = Pipeline::from_file(&path).unwrap();
        assert_eq!(pipeline.routes.len(), 2);

        let texture = &pipeline.routes["texture"];
        assert_eq!(texture.path, PathBuf::from("texc"));
        assert_eq!(texture.max_restart_count, 2);
        assert!(texture.arguments.is_empty());
        assert!(!texture.suppress_stdio);

        let mesh = &pipeline.routes["mesh.ps3"];
        assert_eq!(mesh.arguments, vec!["--fast"]);
        assert_eq!(mesh.extra_environment["MESHC_CACHE"], "1");
        assert_eq!(mesh.hide_environment, vec!["TMPDIR"]);
        assert!(mesh.suppress_stdio);
    }

    #[test]
    fn missing_pipeline_is_empty() {
        let work_dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::from_file(&work_dir.path().join("pipeline.json")).unwrap();
        assert!(pipeline.routes.is_empty());
    }

    #[test]
    fn missing_platform_list_defaults_to_generic() {
        let work_dir = tempfile::tempdir().unwrap();
        let platforms = load_platform_names(&work_dir.path().join("platform.json")).unwrap();
        assert_eq!(platforms, vec!["generic"]);
    }

    #[test]
    fn corrupt_pipeline_is_an_error() {
        let work_dir = tempfile::tempdir().unwrap();
        let path = work_dir.path().join("pipeline.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(Pipeline::from_file(&path).is_err());
    }
}
