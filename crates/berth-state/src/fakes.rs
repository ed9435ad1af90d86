//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryPipelineStore` and `MemoryArtifactRegistry` that satisfy
//! the trait contracts without any external dependencies. Both expose call
//! counters and failure switches so callers can assert on collaborator use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{RegistryError, StorageError};
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryPipelineStore
// ---------------------------------------------------------------------------

/// In-memory pipeline store backed by a `HashMap<name, PipelineRecord>`.
#[derive(Debug, Default)]
pub struct MemoryPipelineStore {
    records: Mutex<HashMap<String, PipelineRecord>>,
    fail_writes: Mutex<Option<String>>,
    puts: AtomicUsize,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful `put` calls.
    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Make every subsequent `put`/`delete` fail with `reason`.
    pub fn fail_writes(&self, reason: impl Into<String>) {
        *self.fail_writes.lock().unwrap() = Some(reason.into());
    }

    fn write_failure(&self) -> Option<String> {
        self.fail_writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn get(&self, name: &str) -> StorageResult<Option<PipelineRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records.get(name).cloned())
    }

    async fn put(&self, name: &str, record: &PipelineRecord) -> StorageResult<()> {
        validate_pipeline_name(name)?;
        if let Some(reason) = self.write_failure() {
            return Err(StorageError::Write {
                name: name.to_string(),
                reason,
            });
        }
        let mut records = self.records.lock().unwrap();
        records.insert(name.to_string(), record.clone());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        if let Some(reason) = self.write_failure() {
            return Err(StorageError::Delete {
                name: name.to_string(),
                reason,
            });
        }
        let mut records = self.records.lock().unwrap();
        records.remove(name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactRegistry
// ---------------------------------------------------------------------------

/// A registered image as seen by the fake registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredImage {
    pub digest: ImageDigest,
    pub build_args: Vec<String>,
}

/// In-memory registry backed by a `HashMap<tag, RegisteredImage>`.
///
/// Keys are the `registry/repository:tag` form so that `app:dev` and
/// `docker.io/library/app:dev` resolve to the same entry.
#[derive(Debug, Default)]
pub struct MemoryArtifactRegistry {
    images: Mutex<HashMap<String, RegisteredImage>>,
    lookup_failure: Mutex<Option<String>>,
    lookups: AtomicUsize,
    registrations: AtomicUsize,
}

impl MemoryArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry with an image, returning its digest.
    pub fn insert(&self, reference: &str, digest: ImageDigest) -> RegistryResult<ImageDigest> {
        let key = ImageReference::parse(reference)?.tagged();
        self.images.lock().unwrap().insert(
            key,
            RegisteredImage {
                digest: digest.clone(),
                build_args: Vec::new(),
            },
        );
        Ok(digest)
    }

    /// Look up what was registered for a reference.
    pub fn registered(&self, reference: &str) -> Option<RegisteredImage> {
        let key = ImageReference::parse(reference).ok()?.tagged();
        self.images.lock().unwrap().get(&key).cloned()
    }

    /// Make every subsequent lookup fail with a transient error.
    pub fn fail_lookups(&self, reason: impl Into<String>) {
        *self.lookup_failure.lock().unwrap() = Some(reason.into());
    }

    /// Restore normal lookups.
    pub fn heal(&self) {
        *self.lookup_failure.lock().unwrap() = None;
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn register_calls(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactRegistry for MemoryArtifactRegistry {
    async fn resolve_digest(&self, reference: &str) -> RegistryResult<ImageDigest> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.lookup_failure.lock().unwrap().clone() {
            return Err(RegistryError::Unavailable {
                reference: reference.to_string(),
                reason,
            });
        }
        let key = ImageReference::parse(reference)?.tagged();
        let images = self.images.lock().unwrap();
        images
            .get(&key)
            .map(|image| image.digest.clone())
            .ok_or_else(|| RegistryError::NotFound {
                reference: reference.to_string(),
            })
    }

    async fn register(
        &self,
        image: &ImageReference,
        build_args: &[String],
    ) -> RegistryResult<()> {
        let digest = image
            .digest
            .clone()
            .ok_or_else(|| RegistryError::InvalidReference {
                reference: image.tagged(),
                reason: "cannot register an unresolved image".to_string(),
            })?;
        self.registrations.fetch_add(1, Ordering::SeqCst);
        let mut images = self.images.lock().unwrap();
        images.insert(
            image.tagged(),
            RegisteredImage {
                digest,
                build_args: build_args.to_vec(),
            },
        );
        Ok(())
    }
}
