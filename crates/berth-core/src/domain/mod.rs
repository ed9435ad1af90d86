//! Domain models for Berth.
//!
//! Canonical definitions for the core entities:
//! - `BuildSpec`: one buildable component of a manifest
//! - `Decision`: build/skip/force outcome for a component
//! - `ManifestLocator`: invocation inputs that locate a manifest
//! - `CanonicalManifestPath`: invocation-independent manifest identity

pub mod build;
pub mod error;
pub mod locator;

// Re-export main types and errors
pub use build::{BuildSpec, Decision};
pub use error::{
    BuildError, DeployError, DeployerError, ManifestError, PathResolutionError,
    RegistryLookupError, Result,
};
pub use locator::{CanonicalManifestPath, ManifestLocator};
