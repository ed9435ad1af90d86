//! Git repository discovery for pipeline identity.
//!
//! Reads repository layout and configuration straight from disk so no `git`
//! binary is needed at deploy time.

use std::path::{Path, PathBuf};

/// Nearest ancestor of `start` (inclusive) that contains a `.git` entry.
///
/// `.git` may be a directory or a `gitdir:` file (worktrees, submodules).
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Repository root that owns an explicit manifest.
///
/// The work tree enclosing the manifest wins, so the identity does not
/// depend on where the command runs. A manifest outside every repository
/// falls back to the working directory's root, which canonicalization then
/// rejects as outside of it.
pub fn manifest_repo_root(manifest: &Path, workdir: &Path) -> Option<PathBuf> {
    manifest
        .parent()
        .and_then(find_repo_root)
        .or_else(|| find_repo_root(workdir))
}

/// Check whether a directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    find_repo_root(dir).is_some()
}

/// Location of the git directory for the work tree rooted at `repo_root`.
fn git_dir(repo_root: &Path) -> Option<PathBuf> {
    let dot_git = repo_root.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git);
    }
    let pointer = std::fs::read_to_string(&dot_git).ok()?;
    let target = pointer.trim().strip_prefix("gitdir:")?.trim();
    let target = PathBuf::from(target);
    Some(if target.is_absolute() {
        target
    } else {
        repo_root.join(target)
    })
}

/// URL of the `origin` remote, if configured.
pub fn remote_origin_url(repo_root: &Path) -> Option<String> {
    let config = std::fs::read_to_string(git_dir(repo_root)?.join("config")).ok()?;
    parse_remote_url(&config, "origin")
}

/// Extract `url` from the `[remote "<remote>"]` section of a git config.
pub fn parse_remote_url(config: &str, remote: &str) -> Option<String> {
    let header = format!("[remote \"{remote}\"]");
    let mut in_section = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_section = line == header;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "url" {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Repository name from a remote URL.
///
/// `https://github.com/okteto/e2e-deploy-test.git` → `e2e-deploy-test`,
/// `git@github.com:org/app.git` → `app`.
pub fn repo_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let name = trimmed.rsplit(['/', ':']).next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
