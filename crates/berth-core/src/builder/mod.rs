//! Image builder collaborator.
//!
//! The coordinator only ever talks to [`ImageBuilder`]; [`DockerCliBuilder`]
//! is the shipped backend.

pub mod docker;

use std::path::PathBuf;

use async_trait::async_trait;
use berth_state::{ImageDigest, ImageReference};
use serde::{Deserialize, Serialize};

use crate::domain::{BuildError, BuildSpec};

pub use docker::DockerCliBuilder;

/// Registry host used for images built without a tag.
pub const LOCAL_REGISTRY: &str = "local";

/// One image build to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub component: String,
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    /// Target tag; `None` builds an anonymous image.
    pub tag: Option<String>,
    pub build_args: Vec<String>,
    pub cache_from: Vec<String>,
    pub export_cache: Vec<String>,
    /// Ignore the local layer cache as well.
    pub no_cache: bool,
}

impl From<&BuildSpec> for BuildRequest {
    fn from(spec: &BuildSpec) -> Self {
        Self {
            component: spec.name.clone(),
            context: spec.context.clone(),
            dockerfile: spec.dockerfile.clone(),
            tag: spec.has_tag().then(|| spec.tag.trim().to_string()),
            build_args: spec.build_args.clone(),
            cache_from: spec.cache_from.clone(),
            export_cache: spec.export_cache.clone(),
            no_cache: false,
        }
    }
}

/// Produces container images.
///
/// A successful build returns a reference carrying the image digest. For a
/// tagged request the reference names that tag; for an untagged one it is a
/// `local/<component>:latest` placeholder.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<ImageReference, BuildError>;
}

/// Reference returned for a build that produced `digest`.
pub fn built_reference(
    request: &BuildRequest,
    digest: ImageDigest,
) -> Result<ImageReference, BuildError> {
    let reference = match &request.tag {
        Some(tag) => ImageReference::parse(tag)?,
        None => ImageReference {
            registry: LOCAL_REGISTRY.to_string(),
            repository: crate::naming::sanitize_name(&request.component),
            tag: berth_state::DEFAULT_TAG.to_string(),
            digest: None,
        },
    };
    Ok(reference.with_digest(digest))
}
