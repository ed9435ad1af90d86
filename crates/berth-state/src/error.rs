//! Error types for berth-state

use thiserror::Error;

/// Errors raised by a pipeline state store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Record could not be read from the backing store
    #[error("failed to read pipeline record {name}: {reason}")]
    Read { name: String, reason: String },

    /// Record could not be written to the backing store
    #[error("failed to write pipeline record {name}: {reason}")]
    Write { name: String, reason: String },

    /// Record could not be removed from the backing store
    #[error("failed to delete pipeline record {name}: {reason}")]
    Delete { name: String, reason: String },

    /// Record name does not satisfy the resource naming rules
    #[error("invalid pipeline name: {name}")]
    InvalidName { name: String },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised by an artifact registry client.
///
/// `NotFound` is a normal answer to a lookup, not a failure; callers should
/// branch on [`RegistryError::is_not_found`] before treating anything else
/// as fatal.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The tag is not present in the registry
    #[error("image not found: {reference}")]
    NotFound { reference: String },

    /// The registry could not be reached or answered with an unexpected status
    #[error("registry unavailable for {reference}: {reason}")]
    Unavailable { reference: String, reason: String },

    /// The registry rejected the supplied credentials
    #[error("registry denied access to {reference}: {reason}")]
    Unauthorized { reference: String, reason: String },

    /// Image reference could not be parsed
    #[error("invalid image reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Digest string is not a `sha256:` content address
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl RegistryError {
    /// Whether this error means "tag absent" rather than a lookup failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Serialization(err.to_string())
    }
}
