//! Pipeline name derivation.

use std::path::Path;

use berth_state::validate_pipeline_name;

use crate::domain::ManifestError;
use crate::git;

/// Maximum length of a DNS-1123 label.
const MAX_NAME_LEN: usize = 63;

/// Reduce arbitrary text to a DNS-1123 label.
///
/// Lowercases, maps every character outside `[a-z0-9-]` to `-`, collapses
/// dash runs, trims dashes at both ends and truncates to 63 characters.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars().flat_map(char::to_lowercase) {
        let ch = if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            ch
        } else {
            '-'
        };
        if ch == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(ch);
    }
    out.truncate(MAX_NAME_LEN);
    out.trim_end_matches('-').to_string()
}

/// Inputs for deriving a pipeline name, highest precedence first.
#[derive(Debug, Default, Clone)]
pub struct NameSources<'a> {
    pub explicit: Option<&'a str>,
    pub manifest: Option<&'a str>,
    pub repo_root: Option<&'a Path>,
    pub workdir: Option<&'a Path>,
}

/// Pick the first source yielding a valid name after sanitization.
///
/// Order: explicit name, manifest `name`, repository name from the `origin`
/// remote, repository root basename, working directory basename.
pub fn derive_pipeline_name(sources: &NameSources<'_>) -> Result<String, ManifestError> {
    let remote = sources
        .repo_root
        .and_then(git::remote_origin_url)
        .and_then(|url| git::repo_name_from_url(&url));
    let basename = |p: Option<&Path>| {
        p.and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    };

    let candidates = [
        sources.explicit.map(str::to_string),
        sources.manifest.map(str::to_string),
        remote,
        basename(sources.repo_root),
        basename(sources.workdir),
    ];

    let mut last_raw = String::new();
    for raw in candidates.into_iter().flatten() {
        let name = sanitize_name(&raw);
        if validate_pipeline_name(&name).is_ok() {
            return Ok(name);
        }
        last_raw = raw;
    }
    Err(ManifestError::InvalidPipelineName(last_raw))
}

/// Tag for a component whose manifest entry names no image.
///
/// `<dev_registry>/<namespace>/<pipeline>-<component>:berth`
pub fn default_image_tag(
    dev_registry: &str,
    namespace: &str,
    pipeline: &str,
    component: &str,
) -> String {
    format!(
        "{}/{}/{}-{}:berth",
        dev_registry.trim_end_matches('/'),
        sanitize_name(namespace),
        pipeline,
        sanitize_name(component)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_replaces() {
        assert_eq!(sanitize_name("My_App.v2"), "my-app-v2");
        assert_eq!(sanitize_name("--a__b--"), "a-b");
        assert_eq!(sanitize_name("e2e-deploy-test"), "e2e-deploy-test");
        assert_eq!(sanitize_name("???"), "");
    }

    #[test]
    fn sanitize_truncates_to_label_length() {
        let long = "a".repeat(80);
        assert_eq!(sanitize_name(&long).len(), 63);

        // Truncation must not leave a trailing dash.
        let edge = format!("{}-b", "a".repeat(62));
        assert_eq!(sanitize_name(&edge), "a".repeat(62));
    }

    #[test]
    fn default_tag_is_namespaced() {
        assert_eq!(
            default_image_tag("registry.dev.local/", "Team_A", "movies", "api"),
            "registry.dev.local/team-a/movies-api:berth"
        );
    }

    #[test]
    fn explicit_name_wins() {
        let sources = NameSources {
            explicit: Some("Override"),
            manifest: Some("from-manifest"),
            workdir: Some(Path::new("/work/dir")),
            ..Default::default()
        };
        assert_eq!(derive_pipeline_name(&sources).unwrap(), "override");
    }

    #[test]
    fn manifest_name_beats_directories() {
        let sources = NameSources {
            manifest: Some("movies"),
            workdir: Some(Path::new("/work/dir")),
            ..Default::default()
        };
        assert_eq!(derive_pipeline_name(&sources).unwrap(), "movies");
    }

    #[test]
    fn remote_url_names_pipeline() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::create_dir(repo.path().join(".git")).unwrap();
        std::fs::write(
            repo.path().join(".git/config"),
            "[remote \"origin\"]\n\turl = https://github.com/okteto/e2e-deploy-test.git\n",
        )
        .unwrap();
        let sources = NameSources {
            repo_root: Some(repo.path()),
            workdir: Some(repo.path()),
            ..Default::default()
        };
        assert_eq!(derive_pipeline_name(&sources).unwrap(), "e2e-deploy-test");
    }

    #[test]
    fn falls_back_to_workdir_basename() {
        let sources = NameSources {
            manifest: Some("!!!"),
            workdir: Some(Path::new("/home/dev/Shop_Front")),
            ..Default::default()
        };
        assert_eq!(derive_pipeline_name(&sources).unwrap(), "shop-front");
    }

    #[test]
    fn no_usable_source_is_an_error() {
        let sources = NameSources {
            explicit: Some("***"),
            ..Default::default()
        };
        assert!(matches!(
            derive_pipeline_name(&sources),
            Err(ManifestError::InvalidPipelineName(_))
        ));
    }
}
