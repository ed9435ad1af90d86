//! Domain-level error taxonomy for Berth.

use std::path::PathBuf;

use berth_state::{RegistryError, StorageError};

/// Manifest location could not be turned into a canonical identity.
#[derive(Debug, thiserror::Error)]
pub enum PathResolutionError {
    #[error("manifest not found: {} is not a regular file", path.display())]
    NotAFile { path: PathBuf },

    #[error(
        "manifest {} is outside of the repository rooted at {}",
        path.display(),
        repo_root.display()
    )]
    OutsideRepository { path: PathBuf, repo_root: PathBuf },

    #[error("working directory must be absolute: {}", path.display())]
    NotAbsolute { path: PathBuf },

    #[error("no manifest found in {}", dir.display())]
    NoDefaultManifest { dir: PathBuf },
}

/// Manifest file could not be read or understood.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid manifest {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("cannot derive a pipeline name from {0:?}")]
    InvalidPipelineName(String),
}

/// Registry lookup failed for a reason other than "tag absent".
#[derive(Debug, thiserror::Error)]
#[error("registry lookup failed for component '{component}': {source}")]
pub struct RegistryLookupError {
    pub component: String,
    #[source]
    pub source: RegistryError,
}

/// Image build execution failed.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("build command exited with status {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("failed to start build: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("build produced no image digest")]
    MissingDigest,

    #[error("unreadable build metadata: {0}")]
    Metadata(String),

    #[error("invalid image reference: {0}")]
    InvalidReference(#[from] RegistryError),

    #[error("build failed: {0}")]
    Other(String),
}

/// Deployer collaborator failure.
#[derive(Debug, thiserror::Error)]
pub enum DeployerError {
    #[error("command '{name}' exited with status {exit_code}: {stderr}")]
    CommandFailed {
        name: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("command '{name}' timed out after {timeout_secs} seconds")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("failed to start command '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

/// Failure of a deploy, destroy or build invocation, tagged with what failed.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("path resolution failed: {0}")]
    PathResolution(#[from] PathResolutionError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    RegistryLookup(#[from] RegistryLookupError),

    #[error("build failed for component '{component}': {source}")]
    Build {
        component: String,
        #[source]
        source: BuildError,
    },

    #[error("failed to register image for component '{component}': {source}")]
    Register {
        component: String,
        #[source]
        source: RegistryError,
    },

    #[error("deploy of pipeline '{pipeline}' failed: {source}")]
    Apply {
        pipeline: String,
        #[source]
        source: DeployerError,
    },

    #[error("teardown of pipeline '{pipeline}' failed: {source}")]
    Teardown {
        pipeline: String,
        #[source]
        source: DeployerError,
    },

    #[error("pipeline state store error: {0}")]
    StateStore(#[from] StorageError),

    #[error("cancelled during {stage}")]
    Cancelled { stage: String },
}

impl DeployError {
    /// Process exit status the CLI reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::Build { .. } => 2,
            DeployError::Apply { .. } | DeployError::Teardown { .. } => 3,
            DeployError::PathResolution(_) => 4,
            DeployError::RegistryLookup(_) | DeployError::Register { .. } => 5,
            DeployError::StateStore(_) => 6,
            DeployError::Manifest(_) => 7,
            DeployError::Cancelled { .. } => 130,
        }
    }

    /// Coordinator stage the failure surfaced in.
    pub fn stage(&self) -> &str {
        match self {
            DeployError::PathResolution(_) | DeployError::Manifest(_) => "resolving",
            DeployError::RegistryLookup(_) => "deciding",
            DeployError::Build { .. } | DeployError::Register { .. } => "building",
            DeployError::Apply { .. } => "applying",
            DeployError::Teardown { .. } => "tearing_down",
            DeployError::StateStore(_) => "recording",
            DeployError::Cancelled { stage } => stage,
        }
    }

    /// Component the failure is attributed to, if any.
    pub fn component(&self) -> Option<&str> {
        match self {
            DeployError::Build { component, .. } | DeployError::Register { component, .. } => {
                Some(component)
            }
            DeployError::RegistryLookup(e) => Some(&e.component),
            _ => None,
        }
    }
}

/// Result type for Berth domain operations.
pub type Result<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        let build = DeployError::Build {
            component: "api".to_string(),
            source: BuildError::MissingDigest,
        };
        let apply = DeployError::Apply {
            pipeline: "app".to_string(),
            source: DeployerError::Other("boom".to_string()),
        };
        let path = DeployError::PathResolution(PathResolutionError::NotAFile {
            path: PathBuf::from("/repo/okteto.yml"),
        });
        let lookup = DeployError::RegistryLookup(RegistryLookupError {
            component: "api".to_string(),
            source: RegistryError::Unavailable {
                reference: "r/api:dev".to_string(),
                reason: "timeout".to_string(),
            },
        });

        let codes = [
            build.exit_code(),
            apply.exit_code(),
            path.exit_code(),
            lookup.exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn build_error_names_component() {
        let err = DeployError::Build {
            component: "frontend".to_string(),
            source: BuildError::CommandFailed {
                exit_code: 1,
                stderr: "COPY failed".to_string(),
            },
        };
        assert_eq!(err.component(), Some("frontend"));
        let msg = err.to_string();
        assert!(msg.contains("frontend"));
    }

    #[test]
    fn path_error_names_manifest() {
        let err = PathResolutionError::OutsideRepository {
            path: PathBuf::from("/tmp/okteto.yml"),
            repo_root: PathBuf::from("/tmp/repo"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/okteto.yml"));
        assert!(msg.contains("/tmp/repo"));
    }
}
