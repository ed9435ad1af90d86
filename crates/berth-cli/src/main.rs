//! Berth - build-deploy CLI
//!
//! The `berth` command turns an application manifest into running workloads,
//! rebuilding only the images the registry does not already have.
//!
//! ## Commands
//!
//! - `deploy`: Build what is missing, run the deploy commands, record the pipeline
//! - `destroy`: Run the destroy commands and forget the pipeline
//! - `build`: Build (or reuse) images without deploying

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use berth_core::{
    init_tracing, ArtifactRegistry, BerthConfig, CommandDeployer, Coordinator, DeployError,
    DeployOutcome, DeployRequest, DockerCliBuilder, FsArtifactIndex, FsPipelineStore, LogFormat,
    OciRegistryClient, RegistryBackend,
};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build-deploy engine with registry-aware image caching", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and a JSON summary
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for `BERTH_*` environment configuration.
#[derive(Args, Debug, Default)]
struct Settings {
    /// Namespace to deploy into
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Directory holding pipeline records and the local image index
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Registry used to tag components whose manifest entry names no image
    #[arg(long, global = true)]
    dev_registry: Option<String>,

    /// Where image digests are looked up: oci or local
    #[arg(long, global = true)]
    registry_backend: Option<RegistryBackend>,

    /// Registry host reached over plain HTTP (repeatable)
    #[arg(long = "insecure-registry", global = true)]
    insecure_registries: Vec<String>,

    /// Maximum number of concurrent image builds
    #[arg(long, global = true)]
    max_parallel_builds: Option<usize>,

    /// Per-command timeout for deploy and destroy commands, in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Load built images locally instead of pushing them
    #[arg(long, global = true)]
    no_push: bool,

    /// Target platform for image builds (e.g. linux/amd64)
    #[arg(long, global = true)]
    platform: Option<String>,
}

/// Which manifest an invocation targets.
#[derive(Args, Debug, Clone)]
struct Target {
    /// Path to the manifest, relative to the working directory
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// Pipeline name (default: manifest name, then repository name)
    #[arg(long)]
    name: Option<String>,

    /// Working directory (default: current directory)
    #[arg(long)]
    workdir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build missing images, run the deploy commands and record the pipeline
    Deploy {
        #[command(flatten)]
        target: Target,

        /// Rebuild every image even if the registry already has it
        #[arg(long)]
        build: bool,
    },

    /// Run the destroy commands and remove the pipeline record
    Destroy {
        #[command(flatten)]
        target: Target,
    },

    /// Build images without deploying
    Build {
        #[command(flatten)]
        target: Target,

        /// Components to build (default: all)
        components: Vec<String>,

        /// Rebuild even if the registry already has the image
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_status(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.settings, cli.json)?;

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(config.log_format, level);

    let coordinator = build_coordinator(&config, cli.settings.platform.as_deref())?;
    let cancel = cancel_on_interrupt();
    let json = config.log_format == LogFormat::Json;

    match cli.command {
        Commands::Deploy { target, build } => {
            let request = target.request()?.with_force_build(build);
            let outcome = coordinator.deploy(&request, &cancel).await?;
            print_outcome("Deployed", &outcome, json)
        }
        Commands::Destroy { target } => {
            let request = target.request()?;
            let outcome = coordinator.destroy(&request, &cancel).await?;
            print_outcome("Destroyed", &outcome, json)
        }
        Commands::Build {
            target,
            components,
            force,
        } => {
            let request = target
                .request()?
                .with_force_build(force)
                .with_components(components);
            let outcome = coordinator.build(&request, &cancel).await?;
            print_outcome("Built", &outcome, json)
        }
    }
}

/// Environment configuration with command-line overrides applied.
fn load_config(settings: &Settings, json: bool) -> Result<BerthConfig> {
    let mut config = BerthConfig::from_env().context("Invalid BERTH_* environment")?;

    if let Some(ns) = &settings.namespace {
        config.namespace = ns.clone();
    }
    if let Some(dir) = &settings.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(registry) = &settings.dev_registry {
        config.dev_registry = Some(registry.clone());
    }
    if let Some(backend) = settings.registry_backend {
        config.registry_backend = backend;
    }
    config
        .insecure_registries
        .extend(settings.insecure_registries.iter().cloned());
    if let Some(n) = settings.max_parallel_builds {
        config.max_parallel_builds = n;
    }
    if let Some(secs) = settings.timeout {
        config.command_timeout_secs = secs;
    }
    if settings.no_push {
        config.push = false;
    }
    if json {
        config.log_format = LogFormat::Json;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_coordinator(config: &BerthConfig, platform: Option<&str>) -> Result<Coordinator> {
    let registry: Arc<dyn ArtifactRegistry> = match config.registry_backend {
        RegistryBackend::Oci => Arc::new(
            OciRegistryClient::new(config.oci_registry_config())
                .context("Failed to create registry client")?,
        ),
        RegistryBackend::Local => Arc::new(
            FsArtifactIndex::new(config.registry_dir())
                .context("Failed to open local image index")?,
        ),
    };

    let store = FsPipelineStore::new(config.pipelines_dir(), &config.namespace)
        .with_context(|| format!("Failed to open state directory {:?}", config.state_dir))?;

    let mut builder = DockerCliBuilder::new().with_push(config.push);
    if let Some(platform) = platform {
        builder = builder.with_platform(platform);
    }
    let deployer = CommandDeployer::new().with_timeout(config.command_timeout_secs);

    info!(
        namespace = %config.namespace,
        state_dir = %config.state_dir.display(),
        registry_backend = ?config.registry_backend,
        "berth configured"
    );

    Ok(Coordinator::new(
        config.coordinator_config(),
        registry,
        Arc::new(builder),
        Arc::new(deployer),
        Arc::new(store),
    ))
}

impl Target {
    fn request(&self) -> Result<DeployRequest> {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        let mut request = DeployRequest::new(
            absolute_workdir(&cwd, self.workdir.as_deref()),
            self.file.clone().unwrap_or_default(),
        );
        if let Some(name) = &self.name {
            request = request.with_name(name);
        }
        Ok(request)
    }
}

fn absolute_workdir(cwd: &Path, workdir: Option<&Path>) -> PathBuf {
    match workdir {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => cwd.join(dir),
        None => cwd.to_path_buf(),
    }
}

/// Cancel the returned token on the first Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });
    cancel
}

fn print_outcome(verb: &str, outcome: &DeployOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    let manifest = if outcome.manifest_path.is_default() {
        "(default manifest)"
    } else {
        outcome.manifest_path.as_str()
    };
    println!("{verb} pipeline '{}' from {manifest}", outcome.pipeline);
    for (component, decision) in &outcome.decisions {
        println!("  {component}: {decision}");
    }
    for (component, image) in &outcome.images {
        println!("  {component} -> {image}");
    }
    if outcome.drift {
        if let Some(previous) = &outcome.previous {
            println!(
                "  note: pipeline was previously deployed from {}",
                previous.manifest_path
            );
        }
    }
    Ok(())
}

/// Exit status for a failed invocation.
fn exit_status(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<DeployError>()
        .map(DeployError::exit_code)
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}
