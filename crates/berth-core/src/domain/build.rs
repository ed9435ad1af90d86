//! Buildable components and the build/skip decision outcome.

use std::fmt;
use std::path::PathBuf;

use berth_state::ImageDigest;
use serde::{Deserialize, Serialize};

/// Build definition for one component of a manifest.
///
/// An empty `tag` means there is no cache key: the component is built
/// whenever it is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Component name (key in the manifest's `build` section).
    pub name: String,

    /// Absolute build context directory.
    pub context: PathBuf,

    /// Absolute dockerfile path.
    pub dockerfile: PathBuf,

    /// Target image tag; empty when the manifest names none.
    pub tag: String,

    /// Build arguments as ordered `KEY=value` pairs.
    pub build_args: Vec<String>,

    /// References to import build cache from.
    pub cache_from: Vec<String>,

    /// References to export build cache to.
    pub export_cache: Vec<String>,

    /// Rebuild even if the tag already exists.
    pub force: bool,
}

impl BuildSpec {
    /// Minimal spec rooted at `context` with the conventional `Dockerfile`.
    pub fn new(name: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        let context = context.into();
        Self {
            name: name.into(),
            dockerfile: context.join("Dockerfile"),
            context,
            tag: String::new(),
            build_args: Vec::new(),
            cache_from: Vec::new(),
            export_cache: Vec::new(),
            force: false,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn has_tag(&self) -> bool {
        !self.tag.trim().is_empty()
    }
}

/// Outcome of the build skip decision for one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The tag already exists; reuse the resolved digest.
    Skip { digest: ImageDigest },

    /// The tag is absent (or there is no tag); build it.
    Build,

    /// Build regardless of what the registry holds.
    ForceRebuild,
}

impl Decision {
    /// Whether the image builder must run for this decision.
    pub fn requires_build(&self) -> bool {
        !matches!(self, Decision::Skip { .. })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Skip { digest } => write!(f, "skip ({})", digest.short()),
            Decision::Build => f.write_str("build"),
            Decision::ForceRebuild => f.write_str("force-rebuild"),
        }
    }
}
