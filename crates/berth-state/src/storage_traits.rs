//! Storage trait definitions for Berth
//!
//! These traits define the two pieces of state the deploy engine consults:
//! - `ArtifactRegistry`: content-addressed image registry (tag → digest)
//! - `PipelineStore`: per-pipeline identity record (get/put/delete)
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{RegistryError, StorageError};

/// Result type for pipeline store operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Registry host assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag assumed when a reference names none.
pub const DEFAULT_TAG: &str = "latest";

/// Prefix of every persisted pipeline record key.
pub const RECORD_PREFIX: &str = "berth-git-";

// ---------------------------------------------------------------------------
// ImageDigest
// ---------------------------------------------------------------------------

/// Image content digest in `sha256:<hex>` form.
///
/// The inner field is private so the string is always a lowercase
/// `sha256:` address produced by `from_bytes` or validated via `FromStr`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageDigest(String);

impl ImageDigest {
    /// Compute the digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ImageDigest(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Full `sha256:<hex>` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex portion without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        let hex = self.hex();
        &hex[..12.min(hex.len())]
    }
}

impl FromStr for ImageDigest {
    type Err = RegistryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("sha256:")
            .ok_or_else(|| RegistryError::InvalidDigest {
                digest: s.to_string(),
            })?;
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RegistryError::InvalidDigest {
                digest: s.to_string(),
            });
        }
        Ok(ImageDigest(format!("sha256:{}", hex.to_ascii_lowercase())))
    }
}

impl TryFrom<String> for ImageDigest {
    type Error = RegistryError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ImageDigest> for String {
    fn from(d: ImageDigest) -> Self {
        d.0
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ImageReference
// ---------------------------------------------------------------------------

/// A container image reference: `registry/repository:tag[@digest]`.
///
/// Without a digest the reference is a mutable tag and must be resolved
/// against a registry before it can be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<ImageDigest>,
}

impl ImageReference {
    /// Parse `[host/]repo[:tag][@sha256:…]`.
    pub fn parse(reference: &str) -> RegistryResult<Self> {
        let invalid = |reason: &str| RegistryError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (name_tag, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => (name, Some(digest.parse::<ImageDigest>()?)),
            None => (trimmed, None),
        };

        // A ':' after the last '/' separates the tag; one before it is a port.
        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(i) => (
                &name_tag[..last_slash + i],
                &name_tag[last_slash + i + 1..],
            ),
            None => (name_tag, DEFAULT_TAG),
        };
        if name.is_empty() || tag.is_empty() {
            return Err(invalid("missing repository or tag"));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            _ if !name.contains('/') => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };
        if repository.is_empty()
            || repository
                .chars()
                .any(|c| c.is_ascii_uppercase() || c.is_whitespace())
        {
            return Err(invalid("repository must be lowercase without whitespace"));
        }

        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
            digest,
        })
    }

    /// `registry/repository:tag`, without the digest.
    pub fn tagged(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }

    /// Attach a resolved digest.
    pub fn with_digest(mut self, digest: ImageDigest) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Whether the reference denotes an immutable, content-addressed image.
    pub fn is_resolved(&self) -> bool {
        self.digest.is_some()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            Some(d) => write!(f, "{}@{}", self.tagged(), d),
            None => f.write_str(&self.tagged()),
        }
    }
}

impl FromStr for ImageReference {
    type Err = RegistryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Content-addressed artifact registry.
///
/// Guarantees:
/// - `resolve_digest` returns `RegistryError::NotFound` for an absent tag and
///   a different variant for every other failure.
/// - A reference accepted by `register` is visible to the next
///   `resolve_digest` from the same process.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Resolve a tag (`host/repo:tag`) to its content digest.
    async fn resolve_digest(&self, reference: &str) -> RegistryResult<ImageDigest>;

    /// Record a freshly built image. The reference must carry its digest.
    async fn register(&self, image: &ImageReference, build_args: &[String])
        -> RegistryResult<()>;
}

// ---------------------------------------------------------------------------
// PipelineStore
// ---------------------------------------------------------------------------

/// Outcome of the last deploy recorded for a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Deployed,
    Error,
}

/// Persisted identity of one deployed application.
///
/// The canonical manifest path is stored under `filename` so other tools
/// can inspect it without knowing this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Sanitized pipeline name
    pub name: String,
    /// Manifest path relative to the repository root ("" = default manifest)
    #[serde(rename = "filename")]
    pub manifest_path: String,
    pub status: PipelineStatus,
    /// Remote URL of the enclosing repository, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// SHA-256 of the manifest bytes at deploy time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
    /// Component name → deployed image reference
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRecord {
    /// Key under which the record for `name` is persisted.
    pub fn store_key(name: &str) -> String {
        format!("{RECORD_PREFIX}{name}")
    }

    /// Whether two records describe the same deployment, ignoring the timestamp.
    pub fn same_deployment(&self, other: &PipelineRecord) -> bool {
        self.name == other.name
            && self.manifest_path == other.manifest_path
            && self.status == other.status
            && self.repository == other.repository
            && self.manifest_digest == other.manifest_digest
            && self.images == other.images
    }
}

/// Pipeline state store.
///
/// Semantics:
/// - `put` is an upsert: one record per pipeline name, never a history.
/// - `get` returns `None` for an unknown pipeline.
/// - `delete` of an unknown pipeline succeeds.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Read the record for a pipeline.
    async fn get(&self, name: &str) -> StorageResult<Option<PipelineRecord>>;

    /// Create or replace the record for a pipeline.
    async fn put(&self, name: &str, record: &PipelineRecord) -> StorageResult<()>;

    /// Remove the record for a pipeline.
    async fn delete(&self, name: &str) -> StorageResult<()>;
}

/// Validate a pipeline name against DNS-1123 label rules.
pub fn validate_pipeline_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && name.len() + RECORD_PREFIX.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName {
            name: name.to_string(),
        })
    }
}
