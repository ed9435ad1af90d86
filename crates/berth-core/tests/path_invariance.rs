//! Manifest identity across working directories on a real filesystem.

use std::path::{Path, PathBuf};

use berth_core::canonical::normalize;
use berth_core::{canonicalize, manifest_repo_root, ManifestLocator, OsFs, PathResolutionError};

fn repo_with_manifest() -> (tempfile::TempDir, PathBuf) {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("shop");
    std::fs::create_dir_all(repo.join(".git")).unwrap();
    std::fs::create_dir_all(repo.join("deploy/dev")).unwrap();
    std::fs::write(repo.join("deploy/dev/okteto.yml"), "deploy:\n  - true\n").unwrap();
    (base, repo)
}

/// Canonicalize the way the coordinator does: repository root from the
/// manifest's work tree, falling back to the working directory's.
fn identity(workdir: &Path, manifest: &str) -> Result<String, PathResolutionError> {
    let target = normalize(&workdir.join(manifest));
    let repo_root = manifest_repo_root(&target, workdir);
    let locator = ManifestLocator::new(workdir, manifest, repo_root);
    canonicalize(&locator, &OsFs).map(|c| c.as_str().to_string())
}

#[test]
fn same_manifest_same_identity_from_any_directory() {
    let (base, repo) = repo_with_manifest();
    let expected = "deploy/dev/okteto.yml";

    let cases: Vec<(PathBuf, String)> = vec![
        (repo.clone(), "deploy/dev/okteto.yml".into()),
        (repo.clone(), "./deploy/./dev/okteto.yml".into()),
        (repo.join("deploy"), "dev/okteto.yml".into()),
        (repo.join("deploy/dev"), "okteto.yml".into()),
        (repo.join("deploy/dev"), "../dev/okteto.yml".into()),
        (base.path().to_path_buf(), "shop/deploy/dev/okteto.yml".into()),
        (
            PathBuf::from("/"),
            repo.join("deploy/dev/okteto.yml").display().to_string(),
        ),
    ];
    for (workdir, manifest) in cases {
        assert_eq!(
            identity(&workdir, &manifest).unwrap(),
            expected,
            "workdir={} manifest={manifest}",
            workdir.display()
        );
    }
}

#[test]
fn absolute_manifest_from_another_checkout() {
    let (base, repo) = repo_with_manifest();
    let other = base.path().join("other");
    std::fs::create_dir_all(other.join(".git")).unwrap();
    let manifest = repo.join("deploy/dev/okteto.yml").display().to_string();

    assert_eq!(identity(&other, &manifest).unwrap(), "deploy/dev/okteto.yml");
    assert_eq!(
        identity(&other, "../shop/deploy/dev/okteto.yml").unwrap(),
        "deploy/dev/okteto.yml"
    );
}

#[test]
fn nested_repository_owns_its_manifest() {
    let base = tempfile::tempdir().unwrap();
    let outer = base.path().join("outer");
    let inner = outer.join("inner");
    std::fs::create_dir_all(outer.join(".git")).unwrap();
    std::fs::create_dir_all(&inner).unwrap();
    std::fs::write(inner.join(".git"), "gitdir: ../.git/modules/inner\n").unwrap();
    std::fs::write(inner.join("okteto.yml"), "deploy:\n  - true\n").unwrap();

    assert_eq!(identity(&inner, "okteto.yml").unwrap(), "okteto.yml");
    assert_eq!(identity(&outer, "inner/okteto.yml").unwrap(), "okteto.yml");
}

#[test]
fn directory_is_not_a_manifest() {
    let (_base, repo) = repo_with_manifest();
    assert!(matches!(
        identity(&repo, "deploy/dev"),
        Err(PathResolutionError::NotAFile { .. })
    ));
}

#[test]
fn sibling_with_shared_prefix_is_outside() {
    let (base, repo) = repo_with_manifest();
    let sibling = base.path().join("shop-infra");
    std::fs::create_dir_all(&sibling).unwrap();
    std::fs::write(sibling.join("okteto.yml"), "deploy:\n  - true\n").unwrap();

    assert!(matches!(
        identity(&repo, "../shop-infra/okteto.yml"),
        Err(PathResolutionError::OutsideRepository { .. })
    ));
}

#[test]
fn without_repository_identity_is_workdir_relative() {
    let base = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(base.path().join("k8s")).unwrap();
    std::fs::write(base.path().join("k8s/okteto.yml"), "deploy:\n  - true\n").unwrap();

    assert_eq!(identity(base.path(), "k8s/okteto.yml").unwrap(), "k8s/okteto.yml");
}

#[test]
fn git_file_marks_a_worktree_root() {
    let base = tempfile::tempdir().unwrap();
    let worktree = base.path().join("wt");
    std::fs::create_dir_all(worktree.join("app")).unwrap();
    std::fs::write(worktree.join(".git"), "gitdir: /elsewhere/.git/worktrees/wt\n").unwrap();
    std::fs::write(worktree.join("app/okteto.yml"), "deploy:\n  - true\n").unwrap();

    assert_eq!(
        identity(&worktree.join("app"), "okteto.yml").unwrap(),
        "app/okteto.yml"
    );
}

#[cfg(unix)]
#[test]
fn symlinked_checkout_keeps_identity() {
    let (base, repo) = repo_with_manifest();
    let link = base.path().join("current");
    std::os::unix::fs::symlink(&repo, &link).unwrap();

    assert_eq!(
        identity(&link.join("deploy"), "dev/okteto.yml").unwrap(),
        "deploy/dev/okteto.yml"
    );
    assert_eq!(
        identity(base.path(), "current/deploy/dev/okteto.yml").unwrap(),
        "deploy/dev/okteto.yml"
    );
}
