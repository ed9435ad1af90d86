//! Build skip decision engine.
//!
//! Decides per component whether an image must be built, and after a build
//! registers the result so the next decision for the same tag is a skip.

use std::sync::Arc;

use berth_state::{ArtifactRegistry, ImageReference};
use tracing::{debug, info, instrument};

use crate::builder::{BuildRequest, ImageBuilder};
use crate::domain::{BuildSpec, Decision, DeployError, RegistryLookupError};

/// Stateless decision engine over an artifact registry.
#[derive(Clone)]
pub struct BuildDecisionEngine {
    registry: Arc<dyn ArtifactRegistry>,
}

impl BuildDecisionEngine {
    pub fn new(registry: Arc<dyn ArtifactRegistry>) -> Self {
        Self { registry }
    }

    /// Decide whether `spec` must be built.
    ///
    /// Only "not found" turns into [`Decision::Build`]; every other registry
    /// failure is returned as a [`RegistryLookupError`].
    #[instrument(skip(self, spec), fields(component = %spec.name, tag = %spec.tag))]
    pub async fn decide(
        &self,
        spec: &BuildSpec,
        force_all: bool,
    ) -> Result<Decision, RegistryLookupError> {
        if force_all || spec.force {
            info!("force build from manifest definition");
            return Ok(Decision::ForceRebuild);
        }

        if !spec.has_tag() {
            debug!("no image tag, building unconditionally");
            return Ok(Decision::Build);
        }

        match self.registry.resolve_digest(spec.tag.trim()).await {
            Ok(digest) => {
                info!(digest = %digest, "Skipping build for image for service {}", spec.name);
                Ok(Decision::Skip { digest })
            }
            Err(e) if e.is_not_found() => {
                debug!("image not found in registry, building");
                Ok(Decision::Build)
            }
            Err(source) => Err(RegistryLookupError {
                component: spec.name.clone(),
                source,
            }),
        }
    }

    /// Carry out `decision` for `spec`.
    ///
    /// A skip yields the tag pinned to the resolved digest without touching
    /// the builder. A build runs `builder` and, for tagged images, registers
    /// the result before returning. A failed build registers nothing.
    #[instrument(skip(self, spec, decision, builder), fields(component = %spec.name, decision = %decision))]
    pub async fn execute(
        &self,
        spec: &BuildSpec,
        decision: &Decision,
        builder: &dyn ImageBuilder,
    ) -> Result<ImageReference, DeployError> {
        let build_err = |source| DeployError::Build {
            component: spec.name.clone(),
            source,
        };

        if let Decision::Skip { digest } = decision {
            let reference = ImageReference::parse(spec.tag.trim())
                .map_err(|e| build_err(e.into()))?;
            return Ok(reference.with_digest(digest.clone()));
        }

        let request = BuildRequest::from(spec);
        let image = builder.build(&request).await.map_err(build_err)?;

        if request.tag.is_some() {
            self.registry
                .register(&image, &spec.build_args)
                .await
                .map_err(|source| DeployError::Register {
                    component: spec.name.clone(),
                    source,
                })?;
            debug!(image = %image, "image registered");
        }
        Ok(image)
    }

    /// `decide` followed by `execute`.
    pub async fn decide_and_build(
        &self,
        spec: &BuildSpec,
        force_all: bool,
        builder: &dyn ImageBuilder,
    ) -> Result<(Decision, ImageReference), DeployError> {
        let decision = self.decide(spec, force_all).await?;
        let image = self.execute(spec, &decision, builder).await?;
        Ok((decision, image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeImageBuilder;
    use berth_state::fakes::MemoryArtifactRegistry;
    use berth_state::ImageDigest;

    fn engine() -> (Arc<MemoryArtifactRegistry>, BuildDecisionEngine) {
        let registry = Arc::new(MemoryArtifactRegistry::new());
        (registry.clone(), BuildDecisionEngine::new(registry))
    }

    #[tokio::test]
    async fn existing_tag_is_skipped() {
        let (registry, engine) = engine();
        let digest = registry
            .insert("reg.io/app/api:dev", ImageDigest::from_bytes(b"api"))
            .unwrap();
        let spec = BuildSpec::new("api", "/repo/api").with_tag("reg.io/app/api:dev");

        let decision = engine.decide(&spec, false).await.unwrap();
        assert_eq!(decision, Decision::Skip { digest: digest.clone() });

        let builder = FakeImageBuilder::new();
        let image = engine.execute(&spec, &decision, &builder).await.unwrap();
        assert_eq!(image.digest, Some(digest));
        assert_eq!(builder.build_calls(), 0);
    }

    #[tokio::test]
    async fn spec_force_beats_registry() {
        let (registry, engine) = engine();
        registry
            .insert("reg.io/app/api:dev", ImageDigest::from_bytes(b"api"))
            .unwrap();
        let spec = BuildSpec::new("api", "/repo/api")
            .with_tag("reg.io/app/api:dev")
            .with_force(true);
        assert_eq!(engine.decide(&spec, false).await.unwrap(), Decision::ForceRebuild);
        assert_eq!(registry.lookup_calls(), 0);
    }

    #[tokio::test]
    async fn build_then_register_makes_next_decision_skip() {
        let (registry, engine) = engine();
        let spec = BuildSpec::new("api", "/repo/api").with_tag("reg.io/app/api:dev");
        let builder = FakeImageBuilder::new();

        let (first, image) = engine.decide_and_build(&spec, false, &builder).await.unwrap();
        assert_eq!(first, Decision::Build);
        assert!(registry.registered("reg.io/app/api:dev").is_some());

        let second = engine.decide(&spec, false).await.unwrap();
        assert_eq!(
            second,
            Decision::Skip {
                digest: image.digest.unwrap()
            }
        );
    }

    #[tokio::test]
    async fn untagged_build_is_not_registered() {
        let (registry, engine) = engine();
        let spec = BuildSpec::new("worker", "/repo/worker");
        let builder = FakeImageBuilder::new();

        let (decision, _) = engine.decide_and_build(&spec, false, &builder).await.unwrap();
        assert_eq!(decision, Decision::Build);
        assert_eq!(registry.register_calls(), 0);
        assert_eq!(registry.lookup_calls(), 0);
    }

    #[tokio::test]
    async fn failed_build_registers_nothing() {
        let (registry, engine) = engine();
        let spec = BuildSpec::new("api", "/repo/api").with_tag("reg.io/app/api:dev");
        let builder = FakeImageBuilder::new();
        builder.fail_builds("COPY failed");

        let err = engine
            .decide_and_build(&spec, false, &builder)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Build { ref component, .. } if component == "api"));
        assert_eq!(registry.register_calls(), 0);
    }

    #[tokio::test]
    async fn transient_lookup_error_propagates() {
        let (registry, engine) = engine();
        registry.fail_lookups("connection reset");
        let spec = BuildSpec::new("api", "/repo/api").with_tag("reg.io/app/api:dev");

        let err = engine.decide(&spec, false).await.unwrap_err();
        assert_eq!(err.component, "api");
        assert!(!err.source.is_not_found());
    }
}
