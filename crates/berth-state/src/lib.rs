//! Berth-State: persistence layer for Berth
//!
//! This crate owns the two pieces of state the deploy engine reconciles
//! against: the artifact registry (which images already exist) and the
//! pipeline store (which manifest a pipeline was last deployed from).
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: record integrity and a strict not-found vs. failure distinction.
//!
//! ## Key Components
//!
//! - `ArtifactRegistry`: tag → digest lookups and registration
//! - `PipelineStore`: per-pipeline record upsert/read/delete
//! - `FsPipelineStore` / `FsArtifactIndex`: on-disk backends
//! - `fakes`: in-memory backends with call counters for tests

mod error;
pub mod fakes;
pub mod fs;
pub mod storage_traits;

pub use error::{RegistryError, StorageError};
pub use fs::{FsArtifactIndex, FsPipelineStore};
pub use storage_traits::{
    validate_pipeline_name, ArtifactRegistry, ImageDigest, ImageReference, PipelineRecord,
    PipelineStatus, PipelineStore, RegistryResult, StorageResult, DEFAULT_REGISTRY, DEFAULT_TAG,
    RECORD_PREFIX,
};
