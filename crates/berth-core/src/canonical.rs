//! Manifest path canonicalization.
//!
//! Turns `(workdir, manifest argument, repository root)` into the manifest's
//! path relative to the repository root. The result never depends on which
//! directory the user invoked from or how they spelled the path, so it can
//! be persisted as the pipeline's identity.
//!
//! Everything here is lexical and synchronous; the only filesystem access
//! goes through [`ManifestFs`].

use std::path::{Component, Path, PathBuf};

use crate::domain::{CanonicalManifestPath, ManifestLocator, PathResolutionError};

/// Filesystem view the canonicalizer checks manifests against.
pub trait ManifestFs: Send + Sync {
    /// Whether `path` names an existing regular file.
    fn is_file(&self, path: &Path) -> bool;

    /// Symlink-resolved absolute path, when the view can provide one.
    fn real_path(&self, _path: &Path) -> Option<PathBuf> {
        None
    }
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl ManifestFs for OsFs {
    fn is_file(&self, path: &Path) -> bool {
        std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
    }

    fn real_path(&self, path: &Path) -> Option<PathBuf> {
        std::fs::canonicalize(path).ok()
    }
}

/// Lexically normalize a path: drop `.`, resolve `..` against the preceding
/// component. `..` at the root of an absolute path is discarded; leading
/// `..` of a relative path is kept.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_os_str()).collect()
}

/// Express `path` relative to `base`. Both must be normalized and absolute.
pub fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let path_parts: Vec<Component<'_>> = path.components().collect();
    let base_parts: Vec<Component<'_>> = base.components().collect();

    let common = path_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &path_parts[common..] {
        rel.push(part.as_os_str());
    }
    rel
}

/// Absolute, normalized location of the manifest named by `locator`.
///
/// Returns `None` for the default manifest (empty argument).
pub fn resolve_manifest_path(locator: &ManifestLocator) -> Option<PathBuf> {
    if locator.is_default() {
        return None;
    }
    // `join` replaces the base when the argument is absolute.
    Some(normalize(&locator.workdir.join(&locator.manifest_path)))
}

/// Canonicalize a manifest location.
///
/// - empty argument → empty canonical path;
/// - otherwise the manifest is resolved against `workdir` and expressed
///   relative to the repository root, or relative to `workdir` when there is
///   no repository;
/// - a manifest that is not a regular file, or that lies outside the
///   repository, is an error.
pub fn canonicalize(
    locator: &ManifestLocator,
    fs: &dyn ManifestFs,
) -> Result<CanonicalManifestPath, PathResolutionError> {
    if !locator.workdir.is_absolute() {
        return Err(PathResolutionError::NotAbsolute {
            path: locator.workdir.clone(),
        });
    }

    let manifest = match resolve_manifest_path(locator) {
        Some(path) => path,
        None => return Ok(CanonicalManifestPath::default_manifest()),
    };

    if !fs.is_file(&manifest) {
        return Err(PathResolutionError::NotAFile { path: manifest });
    }

    let repo_root = match &locator.repo_root {
        Some(root) => normalize(root),
        None => {
            let workdir = normalize(&locator.workdir);
            return Ok(CanonicalManifestPath::from_relative(&relative_to(
                &manifest, &workdir,
            )));
        }
    };

    if let Ok(rel) = manifest.strip_prefix(&repo_root) {
        return Ok(CanonicalManifestPath::from_relative(rel));
    }

    // Aliased mounts (e.g. /var vs /private/var) defeat the lexical check.
    if let (Some(real_manifest), Some(real_root)) =
        (fs.real_path(&manifest), fs.real_path(&repo_root))
    {
        if let Ok(rel) = real_manifest.strip_prefix(&real_root) {
            return Ok(CanonicalManifestPath::from_relative(rel));
        }
    }

    Err(PathResolutionError::OutsideRepository {
        path: manifest,
        repo_root,
    })
}

impl ManifestLocator {
    /// See [`canonicalize`].
    pub fn canonicalize(
        &self,
        fs: &dyn ManifestFs,
    ) -> Result<CanonicalManifestPath, PathResolutionError> {
        canonicalize(self, fs)
    }
}
