use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Identity of a source item, derived from its path under a package root.
///
/// A path like `tex/brick.ps3.texture` decomposes into the resource name
/// (`tex/brick`, directories included), the ordered list of properties
/// (`ps3`) and the resource type (`texture`, the final extension). The
/// name is everything before the first `.` that follows the last
/// directory separator; the type is everything after the last `.`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePath {
    /// Path relative to the package root, forward slashes on all platforms.
    pub relative_path: String,
    /// Path without any extensions.
    pub name: String,
    /// Dot-separated extensions between the name and the type, in order.
    pub properties: Vec<String>,
    /// The final extension; empty for a file without any `.`.
    pub resource_type: String,
}

impl ResourcePath {
    /// Decomposes `path` against the package `root`.
    pub fn parse(root: &Path, path: &Path) -> Result<Self, Error> {
        let relative_path = relative_to(root, path)?;
        Ok(Self::from_relative(relative_path))
    }

    /// Decomposes an already-relative, forward-slash path.
    pub fn from_relative(relative_path: String) -> Self {
        let basename_start = relative_path.rfind('/').map_or(0, |i| i + 1);
        let first_dot = relative_path[basename_start..]
            .find('.')
            .map(|i| basename_start + i);

        match first_dot {
            None => Self {
                name: relative_path.clone(),
                properties: vec![],
                resource_type: String::new(),
                relative_path,
            },
            Some(p1) => {
                // p2 is the last dot of the whole path; p1 <= p2 always holds.
                let p2 = relative_path.rfind('.').unwrap();
                let name = relative_path[..p1].to_owned();
                let resource_type = relative_path[p2 + 1..].to_owned();
                let between = &relative_path[(p1 + 1).min(p2)..p2];
                let properties = if between.is_empty() {
                    vec![]
                } else {
                    between.split('.').map(str::to_owned).collect()
                };
                Self {
                    name,
                    properties,
                    resource_type,
                    relative_path,
                }
            }
        }
    }
}

/// Returns `path` relative to `root` as a forward-slash string.
pub fn relative_to(root: &Path, path: &Path) -> Result<String, Error> {
    let relative = path.strip_prefix(root).map_err(|_e| Error::OutsidePackage {
        root: root.to_owned(),
        path: path.to_owned(),
    })?;

    let mut out = String::new();
    for component in relative.components() {
        let part = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| Error::NonUtf8Path(path.to_owned()))?;
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(part);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::ResourcePath;

    fn parse(relative: &str) -> ResourcePath {
        ResourcePath::parse(Path::new("/proj/pkg.source"), &Path::new("/proj/pkg.source").join(relative)).unwrap()
    }

    #[test]
    fn name_properties_type() {
        let path = parse("tex/brick.ps3.mip.texture");
        assert_eq!(path.relative_path, "tex/brick.ps3.mip.texture");
        assert_eq!(path.name, "tex/brick");
        assert_eq!(path.properties, vec!["ps3", "mip"]);
        assert_eq!(path.resource_type, "texture");
    }

    #[test]
    fn single_extension() {
        let path = parse("models/crate.mesh");
        assert_eq!(path.name, "models/crate");
        assert!(path.properties.is_empty());
        assert_eq!(path.resource_type, "mesh");
    }

    #[test]
    fn no_extension() {
        let path = parse("README");
        assert_eq!(path.name, "README");
        assert!(path.properties.is_empty());
        assert_eq!(path.resource_type, "");
    }

    #[test]
    fn dotted_directory_does_not_split_name() {
        // only dots after the last separator count.
        let path = parse("a.b/c.texture");
        assert_eq!(path.name, "a.b/c");
        assert_eq!(path.resource_type, "texture");
    }

    #[test]
    fn consecutive_dots_yield_no_properties() {
        let path = parse("odd..texture");
        assert_eq!(path.name, "odd");
        assert!(path.properties.is_empty());
        assert_eq!(path.resource_type, "texture");
    }

    #[test]
    fn outside_root_is_rejected() {
        assert!(ResourcePath::parse(Path::new("/proj/pkg.source"), Path::new("/elsewhere/f.txt")).is_err());
    }
}
