//! Manifest location inputs and the canonical identity derived from them.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where a manifest was asked for, as seen by one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLocator {
    /// Absolute working directory of the invocation.
    pub workdir: PathBuf,

    /// Manifest argument exactly as supplied: empty, relative or absolute.
    pub manifest_path: PathBuf,

    /// Nearest enclosing repository root, if any.
    pub repo_root: Option<PathBuf>,
}

impl ManifestLocator {
    pub fn new(
        workdir: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
        repo_root: Option<PathBuf>,
    ) -> Self {
        Self {
            workdir: workdir.into(),
            manifest_path: manifest_path.into(),
            repo_root,
        }
    }

    /// Whether no manifest argument was given.
    pub fn is_default(&self) -> bool {
        self.manifest_path.as_os_str().is_empty()
    }
}

/// Manifest path relative to the repository root, `/`-separated.
///
/// The empty string is the default manifest at the repository root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalManifestPath(String);

impl CanonicalManifestPath {
    /// Identity of the default manifest.
    pub fn default_manifest() -> Self {
        Self(String::new())
    }

    /// Build from a relative path, joining components with `/`.
    pub fn from_relative(path: &Path) -> Self {
        let parts: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Self(parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CanonicalManifestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<CanonicalManifestPath> for String {
    fn from(p: CanonicalManifestPath) -> Self {
        p.0
    }
}
