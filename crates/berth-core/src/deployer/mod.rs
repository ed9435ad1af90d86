//! Deployer collaborator: applies a rendered manifest and tears it down.

pub mod command;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use berth_state::ImageReference;
use serde::{Deserialize, Serialize};

use crate::domain::DeployerError;

pub use crate::manifest::DeployCommand;
pub use command::CommandDeployer;

/// Everything a deployer needs to apply one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedManifest {
    pub pipeline: String,
    pub namespace: String,
    /// Canonical manifest path ("" for the default manifest)
    pub manifest_path: String,
    /// Directory commands run in
    pub manifest_dir: PathBuf,
    pub commands: Vec<DeployCommand>,
    /// Image the commands run in; `None` runs them on the host
    pub deploy_image: Option<String>,
    /// Component → image, pinned to a digest where one is known
    pub images: BTreeMap<String, ImageReference>,
    /// Environment exported to every command
    pub env: BTreeMap<String, String>,
}

/// Everything a deployer needs to remove one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownRequest {
    pub pipeline: String,
    pub namespace: String,
    pub manifest_dir: PathBuf,
    pub commands: Vec<DeployCommand>,
    /// Image the commands run in; `None` runs them on the host
    pub deploy_image: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// Applies and removes deployed workloads.
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn apply(&self, manifest: &RenderedManifest) -> Result<(), DeployerError>;

    async fn teardown(&self, request: &TeardownRequest) -> Result<(), DeployerError>;
}

/// `api-server` → `API_SERVER`.
pub fn env_component_key(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' => c.to_ascii_uppercase(),
            'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect()
}

/// Environment describing the pipeline and its built images.
///
/// Per component: `BERTH_BUILD_<C>_IMAGE` (digest-pinned when possible),
/// `_REGISTRY`, `_REPOSITORY`, `_TAG` and `_SHA`.
pub fn render_environment(
    namespace: &str,
    pipeline: &str,
    images: &BTreeMap<String, ImageReference>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("BERTH_NAMESPACE".to_string(), namespace.to_string());
    env.insert("BERTH_PIPELINE".to_string(), pipeline.to_string());

    for (component, image) in images {
        let prefix = format!("BERTH_BUILD_{}", env_component_key(component));
        let pinned = match &image.digest {
            Some(d) => format!("{}/{}@{}", image.registry, image.repository, d),
            None => image.tagged(),
        };
        let sha = image
            .digest
            .as_ref()
            .map(|d| d.as_str().to_string())
            .unwrap_or_default();

        env.insert(format!("{prefix}_IMAGE"), pinned);
        env.insert(format!("{prefix}_REGISTRY"), image.registry.clone());
        env.insert(format!("{prefix}_REPOSITORY"), image.repository.clone());
        env.insert(format!("{prefix}_TAG"), image.tag.clone());
        env.insert(format!("{prefix}_SHA"), sha);
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_state::ImageDigest;

    #[test]
    fn component_keys_are_shell_safe() {
        assert_eq!(env_component_key("api-server"), "API_SERVER");
        assert_eq!(env_component_key("web.v2"), "WEB_V2");
    }

    #[test]
    fn environment_pins_digest() {
        let digest = ImageDigest::from_bytes(b"api");
        let mut images = BTreeMap::new();
        images.insert(
            "api-server".to_string(),
            ImageReference::parse("reg.io/movies/api:dev")
                .unwrap()
                .with_digest(digest.clone()),
        );
        images.insert(
            "web".to_string(),
            ImageReference::parse("reg.io/movies/web:dev").unwrap(),
        );

        let env = render_environment("team-a", "movies", &images);
        assert_eq!(env["BERTH_NAMESPACE"], "team-a");
        assert_eq!(env["BERTH_PIPELINE"], "movies");
        assert_eq!(
            env["BERTH_BUILD_API_SERVER_IMAGE"],
            format!("reg.io/movies/api@{digest}")
        );
        assert_eq!(env["BERTH_BUILD_API_SERVER_REGISTRY"], "reg.io");
        assert_eq!(env["BERTH_BUILD_API_SERVER_REPOSITORY"], "movies/api");
        assert_eq!(env["BERTH_BUILD_API_SERVER_TAG"], "dev");
        assert_eq!(env["BERTH_BUILD_API_SERVER_SHA"], digest.as_str());
        assert_eq!(env["BERTH_BUILD_WEB_IMAGE"], "reg.io/movies/web:dev");
        assert_eq!(env["BERTH_BUILD_WEB_SHA"], "");
    }
}
