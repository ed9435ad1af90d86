//! Application manifest model and loader.
//!
//! Parses the YAML manifest subset Berth understands: an optional pipeline
//! name, a `build` section keyed by component, and `deploy` / `destroy`
//! command lists.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use berth_state::ImageReference;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::canonical::{normalize, ManifestFs};
use crate::domain::{BuildSpec, ManifestError};

/// File names probed, in order, when no manifest argument is given.
pub const DEFAULT_MANIFEST_NAMES: &[&str] = &[
    "okteto.yml",
    "okteto.yaml",
    ".okteto/okteto.yml",
    "berth.yml",
    "berth.yaml",
];

/// Root of a manifest document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Pipeline name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Buildable components, sorted by name
    #[serde(default)]
    pub build: BTreeMap<String, BuildSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeploySection>,

    #[serde(default)]
    pub destroy: Vec<CommandEntry>,
}

/// One entry of the `build` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default)]
    pub args: BuildArgs,

    #[serde(default)]
    pub cache_from: StringOrList,

    #[serde(default)]
    pub export_cache: StringOrList,

    #[serde(default)]
    pub force: bool,
}

/// Build arguments written either as a map or as `KEY=value` strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildArgs {
    Map(BTreeMap<String, serde_yaml::Value>),
    List(Vec<String>),
}

impl Default for BuildArgs {
    fn default() -> Self {
        BuildArgs::List(Vec::new())
    }
}

impl BuildArgs {
    /// Ordered `KEY=value` pairs. Map entries come out sorted by key.
    pub fn to_pairs(&self) -> Vec<String> {
        match self {
            BuildArgs::List(items) => items.clone(),
            BuildArgs::Map(map) => map
                .iter()
                .map(|(k, v)| format!("{k}={}", scalar_to_string(v)))
                .collect(),
        }
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// A single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl Default for StringOrList {
    fn default() -> Self {
        StringOrList::Many(Vec::new())
    }
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::One(s) if s.trim().is_empty() => Vec::new(),
            StringOrList::One(s) => vec![s.clone()],
            StringOrList::Many(items) => items.clone(),
        }
    }
}

/// The `deploy` section: a bare command list or `{image, commands}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeploySection {
    Commands(Vec<CommandEntry>),
    Detailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        #[serde(default)]
        commands: Vec<CommandEntry>,
    },
}

/// A command written as a string or as `{name, command}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandEntry {
    Plain(String),
    Named {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        command: String,
    },
}

/// A shell command to run during deploy or destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployCommand {
    pub name: String,
    pub command: String,
}

impl From<&CommandEntry> for DeployCommand {
    fn from(entry: &CommandEntry) -> Self {
        match entry {
            CommandEntry::Plain(command) => DeployCommand {
                name: command.clone(),
                command: command.clone(),
            },
            CommandEntry::Named { name, command } => DeployCommand {
                name: name.clone().unwrap_or_else(|| command.clone()),
                command: command.clone(),
            },
        }
    }
}

impl Manifest {
    /// Parse manifest YAML. `path` is used for error messages only.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ManifestError> {
        if content.trim().is_empty() {
            return Err(ManifestError::Invalid {
                path: path.to_path_buf(),
                reason: "manifest is empty".to_string(),
            });
        }
        let manifest: Manifest =
            serde_yaml::from_str(content).map_err(|e| ManifestError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        manifest.validate(path)?;
        Ok(manifest)
    }

    fn validate(&self, path: &Path) -> Result<(), ManifestError> {
        let invalid = |reason: String| ManifestError::Invalid {
            path: path.to_path_buf(),
            reason,
        };

        for (component, section) in &self.build {
            if component.trim().is_empty() {
                return Err(invalid("build component with empty name".to_string()));
            }
            if let Some(image) = section.image.as_deref().filter(|i| !i.trim().is_empty()) {
                ImageReference::parse(image).map_err(|e| {
                    invalid(format!("component '{component}' has an invalid image: {e}"))
                })?;
            }
            if section.args.to_pairs().iter().any(|a| a.trim().is_empty()) {
                return Err(invalid(format!(
                    "component '{component}' has an empty build argument"
                )));
            }
        }

        for cmd in self.deploy_commands().iter().chain(&self.destroy_commands()) {
            if cmd.command.trim().is_empty() {
                return Err(invalid(format!("command '{}' is empty", cmd.name)));
            }
        }
        Ok(())
    }

    /// Commands run on deploy, in manifest order.
    pub fn deploy_commands(&self) -> Vec<DeployCommand> {
        match &self.deploy {
            None => Vec::new(),
            Some(DeploySection::Commands(cmds)) => cmds.iter().map(DeployCommand::from).collect(),
            Some(DeploySection::Detailed { commands, .. }) => {
                commands.iter().map(DeployCommand::from).collect()
            }
        }
    }

    /// Image the deploy commands expect to run in, when declared.
    pub fn deploy_image(&self) -> Option<&str> {
        match &self.deploy {
            Some(DeploySection::Detailed { image, .. }) => image.as_deref(),
            _ => None,
        }
    }

    /// Commands run on destroy, in manifest order.
    pub fn destroy_commands(&self) -> Vec<DeployCommand> {
        self.destroy.iter().map(DeployCommand::from).collect()
    }
}

/// A manifest read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedManifest {
    /// Absolute manifest path
    pub path: PathBuf,
    /// Directory relative build paths resolve against
    pub dir: PathBuf,
    /// Hex SHA-256 of the manifest bytes
    pub digest: String,
    pub manifest: Manifest,
}

impl LoadedManifest {
    /// Parse `content` as if it had been read from `path`.
    pub fn from_content(path: &Path, content: &[u8]) -> Result<Self, ManifestError> {
        let text = std::str::from_utf8(content).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let manifest = Manifest::parse(text, path)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        Ok(Self {
            path: path.to_path_buf(),
            dir,
            digest: hex::encode(Sha256::digest(content)),
            manifest,
        })
    }

    /// Build specs for every component, sorted by component name.
    ///
    /// Relative `context` and `dockerfile` resolve against the manifest
    /// directory; the dockerfile defaults to `<context>/Dockerfile`.
    pub fn build_specs(&self) -> Vec<BuildSpec> {
        self.manifest
            .build
            .iter()
            .map(|(name, section)| {
                let context = normalize(&self.dir.join(section.context.as_deref().unwrap_or(".")));
                let mut spec = BuildSpec::new(name.clone(), context);
                if let Some(dockerfile) = &section.dockerfile {
                    spec.dockerfile = normalize(&self.dir.join(dockerfile));
                }
                spec.tag = section.image.clone().unwrap_or_default().trim().to_string();
                spec.build_args = section.args.to_pairs();
                spec.cache_from = section.cache_from.to_vec();
                spec.export_cache = section.export_cache.to_vec();
                spec.force = section.force;
                spec
            })
            .collect()
    }
}

/// First default manifest present in `dir`.
pub fn discover_default_manifest(dir: &Path, fs: &dyn ManifestFs) -> Option<PathBuf> {
    DEFAULT_MANIFEST_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| fs.is_file(candidate))
}

/// Manifest parser collaborator.
#[async_trait]
pub trait ManifestLoader: Send + Sync {
    /// Read and parse the manifest at an absolute path.
    async fn load(&self, path: &Path) -> Result<LoadedManifest, ManifestError>;
}

/// Loads YAML manifests from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlManifestLoader;

#[async_trait]
impl ManifestLoader for YamlManifestLoader {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn load(&self, path: &Path) -> Result<LoadedManifest, ManifestError> {
        let content = tokio::fs::read(path)
            .await
            .map_err(|source| ManifestError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let loaded = LoadedManifest::from_content(path, &content)?;
        debug!(
            components = loaded.manifest.build.len(),
            digest = %loaded.digest,
            "manifest loaded"
        );
        Ok(loaded)
    }
}
