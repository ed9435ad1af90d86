//! Berth Core Library
//!
//! Build-deploy identity and caching engine: manifest path canonicalization,
//! the build skip decision, and the deploy/destroy coordinator that ties them
//! to the pipeline state store.

pub mod builder;
pub mod canonical;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod deployer;
pub mod domain;
pub mod fakes;
pub mod git;
pub mod manifest;
pub mod naming;
pub mod obs;
pub mod registry;
pub mod telemetry;

pub use domain::{
    BuildError, BuildSpec, CanonicalManifestPath, Decision, DeployError, DeployerError,
    ManifestError, ManifestLocator, PathResolutionError, RegistryLookupError, Result,
};

pub use builder::{BuildRequest, DockerCliBuilder, ImageBuilder};
pub use canonical::{canonicalize, ManifestFs, OsFs};
pub use config::{BerthConfig, ConfigError, CoordinatorConfig, RegistryBackend};
pub use coordinator::{Coordinator, DeployOutcome, DeployRequest, DeployStage};
pub use decision::BuildDecisionEngine;
pub use deployer::{CommandDeployer, DeployCommand, Deployer, RenderedManifest, TeardownRequest};
pub use git::{find_repo_root, is_git_repo, manifest_repo_root, remote_origin_url};
pub use manifest::{LoadedManifest, Manifest, ManifestLoader, YamlManifestLoader};
pub use naming::{derive_pipeline_name, sanitize_name};
pub use registry::{OciRegistryClient, OciRegistryConfig};
pub use telemetry::{init_tracing, LogFormat};

pub use berth_state::{
    ArtifactRegistry, FsArtifactIndex, FsPipelineStore, ImageDigest, ImageReference,
    PipelineRecord, PipelineStatus, PipelineStore,
};
