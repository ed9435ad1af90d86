//! Deploy, destroy and build orchestration.
//!
//! Deploy runs `Resolving → Deciding → Building → Applying → Recording →
//! Done`; destroy runs `Resolving → TearingDown → Recording`; build runs
//! `Resolving → Deciding → Building`. Any failure ends the run with a
//! [`DeployError`] whose [`stage`](DeployError::stage) names where it
//! happened. A record is written only after a successful apply and deleted
//! only after a successful teardown.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use berth_state::{
    ArtifactRegistry, ImageReference, PipelineRecord, PipelineStatus, PipelineStore,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument, Span};
use uuid::Uuid;

use crate::builder::ImageBuilder;
use crate::canonical::{canonicalize, normalize, resolve_manifest_path, ManifestFs, OsFs};
use crate::config::CoordinatorConfig;
use crate::decision::BuildDecisionEngine;
use crate::deployer::{render_environment, Deployer, RenderedManifest, TeardownRequest};
use crate::domain::{
    BuildError, BuildSpec, CanonicalManifestPath, Decision, DeployError, ManifestError,
    ManifestLocator, PathResolutionError, Result,
};
use crate::git;
use crate::manifest::{
    discover_default_manifest, LoadedManifest, ManifestLoader, YamlManifestLoader,
};
use crate::naming::{default_image_tag, derive_pipeline_name, NameSources};
use crate::obs;

/// Coordinator state machine stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    Resolving,
    Deciding,
    Building,
    Applying,
    Recording,
    TearingDown,
    Done,
}

impl DeployStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::Resolving => "resolving",
            DeployStage::Deciding => "deciding",
            DeployStage::Building => "building",
            DeployStage::Applying => "applying",
            DeployStage::Recording => "recording",
            DeployStage::TearingDown => "tearing_down",
            DeployStage::Done => "done",
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployRequest {
    /// Absolute working directory
    pub workdir: PathBuf,
    /// Manifest argument as given; empty for the default manifest
    pub manifest_path: PathBuf,
    /// Explicit pipeline name
    pub name: Option<String>,
    /// Rebuild every component regardless of the registry
    pub force_build: bool,
    /// Restrict building to these components (build flow only)
    pub components: Vec<String>,
}

impl DeployRequest {
    pub fn new(workdir: impl Into<PathBuf>, manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            manifest_path: manifest_path.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_force_build(mut self, force: bool) -> Self {
        self.force_build = force;
        self
    }

    pub fn with_components(mut self, components: Vec<String>) -> Self {
        self.components = components;
        self
    }
}

/// Result of a successful invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployOutcome {
    /// Correlates the log lines of one invocation
    pub run_id: Uuid,
    pub pipeline: String,
    pub manifest_path: CanonicalManifestPath,
    /// Stages entered, in order
    pub stages: Vec<DeployStage>,
    pub decisions: BTreeMap<String, Decision>,
    pub images: BTreeMap<String, ImageReference>,
    /// Record found before this invocation
    pub previous: Option<PipelineRecord>,
    /// Record written by this invocation
    pub record: Option<PipelineRecord>,
    /// The stored manifest path differed from the resolved one
    pub drift: bool,
}

impl DeployOutcome {
    /// Components the builder ran for.
    pub fn built(&self) -> Vec<&str> {
        self.decisions
            .iter()
            .filter(|(_, d)| d.requires_build())
            .map(|(c, _)| c.as_str())
            .collect()
    }

    /// Components reused from the registry.
    pub fn skipped(&self) -> Vec<&str> {
        self.decisions
            .iter()
            .filter(|(_, d)| !d.requires_build())
            .map(|(c, _)| c.as_str())
            .collect()
    }

    /// The written record matches the previous one apart from its timestamp.
    pub fn unchanged(&self) -> bool {
        match (&self.previous, &self.record) {
            (Some(previous), Some(record)) => previous.same_deployment(record),
            _ => false,
        }
    }
}

/// Identity and manifest of the pipeline an invocation targets.
struct Resolved {
    canonical: CanonicalManifestPath,
    manifest: LoadedManifest,
    pipeline: String,
    repository: Option<String>,
}

/// Runs deploy, destroy and build invocations against injected collaborators.
pub struct Coordinator {
    config: CoordinatorConfig,
    fs: Arc<dyn ManifestFs>,
    loader: Arc<dyn ManifestLoader>,
    engine: BuildDecisionEngine,
    builder: Arc<dyn ImageBuilder>,
    deployer: Arc<dyn Deployer>,
    store: Arc<dyn PipelineStore>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<dyn ArtifactRegistry>,
        builder: Arc<dyn ImageBuilder>,
        deployer: Arc<dyn Deployer>,
        store: Arc<dyn PipelineStore>,
    ) -> Self {
        Self {
            config,
            fs: Arc::new(OsFs),
            loader: Arc::new(YamlManifestLoader),
            engine: BuildDecisionEngine::new(registry),
            builder,
            deployer,
            store,
        }
    }

    pub fn with_manifest_fs(mut self, fs: Arc<dyn ManifestFs>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_manifest_loader(mut self, loader: Arc<dyn ManifestLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Build what is needed, apply, then record the pipeline.
    pub async fn deploy(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<DeployOutcome> {
        let (start, mut outcome, span) = begin("deploy");
        async move {
            let result = self.run_deploy(request, cancel, &mut outcome).await;
            finish("deploy", start, outcome, result)
        }
        .instrument(span)
        .await
    }

    /// Tear the pipeline down, then delete its record.
    pub async fn destroy(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<DeployOutcome> {
        let (start, mut outcome, span) = begin("destroy");
        async move {
            let result = self.run_destroy(request, cancel, &mut outcome).await;
            finish("destroy", start, outcome, result)
        }
        .instrument(span)
        .await
    }

    /// Decide and build only; nothing is applied or recorded.
    pub async fn build(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<DeployOutcome> {
        let (start, mut outcome, span) = begin("build");
        async move {
            let result = self.run_build(request, cancel, &mut outcome).await;
            finish("build", start, outcome, result)
        }
        .instrument(span)
        .await
    }

    async fn run_deploy(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
        outcome: &mut DeployOutcome,
    ) -> Result<()> {
        enter_stage(outcome, DeployStage::Resolving, cancel)?;
        let resolved = self.resolve("deploy", request, outcome).await?;
        self.check_existing(&resolved, outcome).await?;

        enter_stage(outcome, DeployStage::Deciding, cancel)?;
        let specs = self.build_specs(&resolved, &[])?;
        let decided = self
            .decide_all(&resolved.pipeline, specs, request.force_build, cancel, outcome)
            .await?;

        enter_stage(outcome, DeployStage::Building, cancel)?;
        outcome.images = self.build_all(&resolved.pipeline, decided, cancel).await?;

        enter_stage(outcome, DeployStage::Applying, cancel)?;
        let rendered = RenderedManifest {
            pipeline: resolved.pipeline.clone(),
            namespace: self.config.namespace.clone(),
            manifest_path: resolved.canonical.to_string(),
            manifest_dir: resolved.manifest.dir.clone(),
            commands: resolved.manifest.manifest.deploy_commands(),
            deploy_image: resolved.manifest.manifest.deploy_image().map(str::to_string),
            images: outcome.images.clone(),
            env: render_environment(&self.config.namespace, &resolved.pipeline, &outcome.images),
        };
        until_cancelled(cancel, DeployStage::Applying, async {
            self.deployer
                .apply(&rendered)
                .await
                .map_err(|source| DeployError::Apply {
                    pipeline: resolved.pipeline.clone(),
                    source,
                })
        })
        .await?;

        enter_stage(outcome, DeployStage::Recording, cancel)?;
        let record = PipelineRecord {
            name: resolved.pipeline.clone(),
            manifest_path: resolved.canonical.to_string(),
            status: PipelineStatus::Deployed,
            repository: resolved.repository.clone(),
            manifest_digest: Some(resolved.manifest.digest.clone()),
            images: outcome
                .images
                .iter()
                .map(|(c, i)| (c.clone(), i.to_string()))
                .collect(),
            updated_at: Utc::now(),
        };
        self.store.put(&resolved.pipeline, &record).await?;
        info!(
            pipeline = %resolved.pipeline,
            manifest_path = %resolved.canonical,
            "pipeline recorded"
        );
        outcome.record = Some(record);
        if outcome.unchanged() {
            info!(pipeline = %resolved.pipeline, "redeploy left the pipeline unchanged");
        }
        Ok(())
    }

    async fn run_destroy(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
        outcome: &mut DeployOutcome,
    ) -> Result<()> {
        enter_stage(outcome, DeployStage::Resolving, cancel)?;
        let resolved = self.resolve("destroy", request, outcome).await?;
        self.check_existing(&resolved, outcome).await?;

        enter_stage(outcome, DeployStage::TearingDown, cancel)?;
        let images: BTreeMap<String, ImageReference> = outcome
            .previous
            .iter()
            .flat_map(|r| r.images.iter())
            .filter_map(|(c, i)| ImageReference::parse(i).ok().map(|i| (c.clone(), i)))
            .collect();
        let teardown = TeardownRequest {
            pipeline: resolved.pipeline.clone(),
            namespace: self.config.namespace.clone(),
            manifest_dir: resolved.manifest.dir.clone(),
            commands: resolved.manifest.manifest.destroy_commands(),
            deploy_image: resolved.manifest.manifest.deploy_image().map(str::to_string),
            env: render_environment(&self.config.namespace, &resolved.pipeline, &images),
        };
        until_cancelled(cancel, DeployStage::TearingDown, async {
            self.deployer
                .teardown(&teardown)
                .await
                .map_err(|source| DeployError::Teardown {
                    pipeline: resolved.pipeline.clone(),
                    source,
                })
        })
        .await?;

        enter_stage(outcome, DeployStage::Recording, cancel)?;
        self.store.delete(&resolved.pipeline).await?;
        info!(
            pipeline = %resolved.pipeline,
            existed = outcome.previous.is_some(),
            "pipeline record removed"
        );
        Ok(())
    }

    async fn run_build(
        &self,
        request: &DeployRequest,
        cancel: &CancellationToken,
        outcome: &mut DeployOutcome,
    ) -> Result<()> {
        enter_stage(outcome, DeployStage::Resolving, cancel)?;
        let resolved = self.resolve("build", request, outcome).await?;

        enter_stage(outcome, DeployStage::Deciding, cancel)?;
        let specs = self.build_specs(&resolved, &request.components)?;
        let decided = self
            .decide_all(&resolved.pipeline, specs, request.force_build, cancel, outcome)
            .await?;

        enter_stage(outcome, DeployStage::Building, cancel)?;
        outcome.images = self.build_all(&resolved.pipeline, decided, cancel).await?;
        Ok(())
    }

    /// Locate and load the manifest and derive the pipeline identity.
    async fn resolve(
        &self,
        operation: &str,
        request: &DeployRequest,
        outcome: &mut DeployOutcome,
    ) -> Result<Resolved> {
        if !request.workdir.is_absolute() {
            return Err(PathResolutionError::NotAbsolute {
                path: request.workdir.clone(),
            }
            .into());
        }
        let workdir = normalize(&request.workdir);
        let locator = ManifestLocator::new(workdir.clone(), request.manifest_path.clone(), None);

        let (manifest_file, repo_root, canonical) = match resolve_manifest_path(&locator) {
            None => {
                let repo_root = git::find_repo_root(&workdir);
                let dir = repo_root.clone().unwrap_or_else(|| workdir.clone());
                let file = discover_default_manifest(&dir, self.fs.as_ref())
                    .ok_or(PathResolutionError::NoDefaultManifest { dir })?;
                (file, repo_root, CanonicalManifestPath::default_manifest())
            }
            Some(file) => {
                let repo_root = git::manifest_repo_root(&file, &workdir);
                let locator = ManifestLocator {
                    repo_root: repo_root.clone(),
                    ..locator
                };
                let canonical = canonicalize(&locator, self.fs.as_ref())?;
                (file, repo_root, canonical)
            }
        };
        debug!(manifest = %manifest_file.display(), canonical = %canonical, "manifest resolved");

        let manifest = self.loader.load(&manifest_file).await?;
        let pipeline = derive_pipeline_name(&NameSources {
            explicit: request.name.as_deref(),
            manifest: manifest.manifest.name.as_deref(),
            repo_root: repo_root.as_deref(),
            workdir: Some(workdir.as_path()),
        })?;
        let repository = repo_root.as_deref().and_then(git::remote_origin_url);

        obs::record_pipeline(&Span::current(), &pipeline);
        obs::emit_started(operation, &pipeline, canonical.as_str());
        outcome.pipeline = pipeline.clone();
        outcome.manifest_path = canonical.clone();

        Ok(Resolved {
            canonical,
            manifest,
            pipeline,
            repository,
        })
    }

    /// Read the stored record and report identity drift.
    async fn check_existing(
        &self,
        resolved: &Resolved,
        outcome: &mut DeployOutcome,
    ) -> Result<()> {
        let existing = self.store.get(&resolved.pipeline).await?;
        if let Some(record) = &existing {
            if record.manifest_path != resolved.canonical.as_str() {
                obs::emit_manifest_drift(
                    &resolved.pipeline,
                    &record.manifest_path,
                    resolved.canonical.as_str(),
                );
                outcome.drift = true;
            } else if record.manifest_digest.as_deref() != Some(resolved.manifest.digest.as_str()) {
                debug!("manifest content changed since last deploy");
            }
            if record.status == PipelineStatus::Error {
                info!("previous deploy of this pipeline ended in error");
            }
        }
        outcome.previous = existing;
        Ok(())
    }

    /// Build specs for the manifest, with default tags applied.
    fn build_specs(&self, resolved: &Resolved, only: &[String]) -> Result<Vec<BuildSpec>> {
        let mut specs = resolved.manifest.build_specs();

        if let Some(unknown) = only.iter().find(|c| !specs.iter().any(|s| &s.name == *c)) {
            return Err(ManifestError::Invalid {
                path: resolved.manifest.path.clone(),
                reason: format!("unknown build component '{unknown}'"),
            }
            .into());
        }
        if !only.is_empty() {
            specs.retain(|s| only.contains(&s.name));
        }

        if let Some(registry) = &self.config.dev_registry {
            for spec in specs.iter_mut().filter(|s| !s.has_tag()) {
                spec.tag = default_image_tag(
                    registry,
                    &self.config.namespace,
                    &resolved.pipeline,
                    &spec.name,
                );
            }
        }
        Ok(specs)
    }

    /// One decision per spec, in component order.
    async fn decide_all(
        &self,
        pipeline: &str,
        specs: Vec<BuildSpec>,
        force_all: bool,
        cancel: &CancellationToken,
        outcome: &mut DeployOutcome,
    ) -> Result<Vec<(BuildSpec, Decision)>> {
        let mut decided = Vec::with_capacity(specs.len());
        for spec in specs {
            let decision = until_cancelled(cancel, DeployStage::Deciding, async {
                self.engine.decide(&spec, force_all).await.map_err(DeployError::from)
            })
            .await?;
            obs::emit_decision(pipeline, &spec.name, &decision);
            outcome.decisions.insert(spec.name.clone(), decision.clone());
            decided.push((spec, decision));
        }
        Ok(decided)
    }

    /// Carry out decisions; builds run concurrently up to the configured limit.
    ///
    /// After the first failure no further builds start; builds already
    /// running finish and keep their registrations.
    async fn build_all(
        &self,
        pipeline: &str,
        decided: Vec<(BuildSpec, Decision)>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, ImageReference>> {
        let mut images = BTreeMap::new();
        let sem = Arc::new(Semaphore::new(self.config.max_parallel_builds.max(1)));
        let (fail_tx, _) = watch::channel(false);
        let fail_flag = Arc::new(fail_tx);

        let mut names = Vec::new();
        let mut tasks = Vec::new();
        for (spec, decision) in decided {
            if !decision.requires_build() {
                let image = self.engine.execute(&spec, &decision, self.builder.as_ref()).await?;
                obs::emit_image_ready(pipeline, &spec.name, &image.to_string(), false);
                images.insert(spec.name, image);
                continue;
            }

            let engine = self.engine.clone();
            let builder = Arc::clone(&self.builder);
            let sem = Arc::clone(&sem);
            let fail_rx = fail_flag.subscribe();
            let fail_flag = Arc::clone(&fail_flag);
            names.push(spec.name.clone());
            tasks.push(tokio::spawn(
                async move {
                    let _permit = sem.acquire_owned().await.ok();
                    // A sibling already failed.
                    if *fail_rx.borrow() {
                        return None;
                    }
                    let result = engine.execute(&spec, &decision, builder.as_ref()).await;
                    if result.is_err() {
                        let _ = fail_flag.send(true);
                    }
                    Some(result)
                }
                .instrument(Span::current()),
            ));
        }

        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                for handle in &aborts {
                    handle.abort();
                }
                return Err(cancelled(DeployStage::Building));
            }
            joined = futures::future::join_all(tasks) => joined,
        };

        let mut first_error = None;
        for (name, joined) in names.into_iter().zip(joined) {
            match joined {
                Ok(Some(Ok(image))) => {
                    obs::emit_image_ready(pipeline, &name, &image.to_string(), true);
                    images.insert(name, image);
                }
                Ok(Some(Err(e))) => {
                    first_error.get_or_insert(e);
                }
                Ok(None) => debug!(component = %name, "build not started after earlier failure"),
                Err(e) => {
                    first_error.get_or_insert(DeployError::Build {
                        component: name,
                        source: BuildError::Other(format!("build task failed: {e}")),
                    });
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(images),
        }
    }
}

fn cancelled(stage: DeployStage) -> DeployError {
    DeployError::Cancelled {
        stage: stage.to_string(),
    }
}

/// Record a stage transition, refusing to enter it once cancelled.
fn enter_stage(
    outcome: &mut DeployOutcome,
    stage: DeployStage,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(cancelled(stage));
    }
    obs::emit_stage(&outcome.pipeline, stage.as_str());
    outcome.stages.push(stage);
    Ok(())
}

/// Run `fut` unless `cancel` fires first.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    stage: DeployStage,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled(stage)),
        result = fut => result,
    }
}

fn begin(operation: &str) -> (Instant, DeployOutcome, Span) {
    let outcome = DeployOutcome {
        run_id: Uuid::new_v4(),
        ..Default::default()
    };
    let span = obs::pipeline_span(operation, &outcome.run_id.to_string());
    (Instant::now(), outcome, span)
}

fn finish(
    operation: &str,
    start: Instant,
    mut outcome: DeployOutcome,
    result: Result<()>,
) -> Result<DeployOutcome> {
    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(()) => {
            obs::emit_stage(&outcome.pipeline, DeployStage::Done.as_str());
            outcome.stages.push(DeployStage::Done);
            obs::emit_finished(operation, &outcome.pipeline, duration_ms, true);
            Ok(outcome)
        }
        Err(e) => {
            obs::emit_failed(&outcome.pipeline, e.stage(), &e);
            obs::emit_finished(operation, &outcome.pipeline, duration_ms, false);
            Err(e)
        }
    }
}
