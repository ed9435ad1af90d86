//! Filesystem-backed storage backends.
//!
//! - `FsPipelineStore`: one JSON document per pipeline, laid out as
//!   `<root>/<namespace>/berth-git-<name>.json`.
//! - `FsArtifactIndex`: a local tag → digest index for images that live in a
//!   local daemon rather than a remote registry, stored at
//!   `<root>/images.json`.
//!
//! Writes go through a temp file in the target directory followed by a
//! rename, so a reader never observes a half-written document.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{RegistryError, StorageError};
use crate::storage_traits::*;

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no parent directory", path.display()),
        )
    })?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn write_atomic_async(path: PathBuf, data: Vec<u8>) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || write_atomic(&path, &data))
        .await
        .map_err(std::io::Error::other)?
}

// ---------------------------------------------------------------------------
// FsPipelineStore
// ---------------------------------------------------------------------------

/// Pipeline store keeping one JSON document per pipeline on disk.
pub struct FsPipelineStore {
    namespace_dir: PathBuf,
}

impl FsPipelineStore {
    /// Create a store rooted at `root` for `namespace`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>, namespace: &str) -> StorageResult<Self> {
        let namespace_dir = root.as_ref().join(namespace);
        std::fs::create_dir_all(&namespace_dir)?;
        Ok(Self { namespace_dir })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.namespace_dir
            .join(format!("{}.json", PipelineRecord::store_key(name)))
    }
}

#[async_trait]
impl PipelineStore for FsPipelineStore {
    async fn get(&self, name: &str) -> StorageResult<Option<PipelineRecord>> {
        validate_pipeline_name(name)?;
        let path = self.record_path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::Read {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        let record = serde_json::from_slice(&bytes).map_err(|e| StorageError::Read {
            name: name.to_string(),
            reason: format!("corrupt record at {}: {e}", path.display()),
        })?;
        Ok(Some(record))
    }

    async fn put(&self, name: &str, record: &PipelineRecord) -> StorageResult<()> {
        validate_pipeline_name(name)?;
        let path = self.record_path(name);
        let data = serde_json::to_vec_pretty(record)?;
        write_atomic_async(path.clone(), data)
            .await
            .map_err(|e| StorageError::Write {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!(pipeline = %name, path = %path.display(), "pipeline record written");
        Ok(())
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        validate_pipeline_name(name)?;
        match tokio::fs::remove_file(self.record_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Delete {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// FsArtifactIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    digest: ImageDigest,
    #[serde(default)]
    build_args: Vec<String>,
    registered_at: DateTime<Utc>,
}

/// Local artifact registry persisted as a single JSON index file.
///
/// Lookups and registrations are serialized through an async mutex so a
/// registration is visible to the next lookup from the same process.
pub struct FsArtifactIndex {
    index_path: PathBuf,
    lock: Mutex<()>,
}

impl FsArtifactIndex {
    pub fn new(root: impl AsRef<Path>) -> RegistryResult<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            index_path: root.as_ref().join("images.json"),
            lock: Mutex::new(()),
        })
    }

    async fn load(&self) -> RegistryResult<BTreeMap<String, IndexEntry>> {
        match tokio::fs::read(&self.index_path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(RegistryError::Io(e)),
        }
    }
}

#[async_trait]
impl ArtifactRegistry for FsArtifactIndex {
    async fn resolve_digest(&self, reference: &str) -> RegistryResult<ImageDigest> {
        let key = ImageReference::parse(reference)?.tagged();
        let _guard = self.lock.lock().await;
        let index = self.load().await?;
        index
            .get(&key)
            .map(|entry| entry.digest.clone())
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
        let _guard = self.lock.lock().await;
        let mut index = self.load().await?;
        index.insert(
            image.tagged(),
            IndexEntry {
                digest,
                build_args: build_args.to_vec(),
                registered_at: Utc::now(),
            },
        );
        let data = serde_json::to_vec_pretty(&index)?;
        write_atomic_async(self.index_path.clone(), data).await?;
        debug!(image = %image, "image registered in local index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, path: &str) -> PipelineRecord {
        PipelineRecord {
            name: name.to_string(),
            manifest_path: path.to_string(),
            status: PipelineStatus::Deployed,
            repository: Some("https://github.com/okteto/e2e-deploy-test.git".to_string()),
            manifest_digest: None,
            images: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_writes_one_document_per_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPipelineStore::new(dir.path(), "dev").unwrap();

        store.put("app", &record("app", "")).await.unwrap();
        store
            .put("app", &record("app", "subdirA/okteto.yml"))
            .await
            .unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("dev"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
        let got = store.get("app").await.unwrap().unwrap();
        assert_eq!(got.manifest_path, "subdirA/okteto.yml");
    }

    #[tokio::test]
    async fn document_exposes_filename_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPipelineStore::new(dir.path(), "dev").unwrap();
        store
            .put("app", &record("app", "subdirA/subdirB/okteto.yml"))
            .await
            .unwrap();

        let raw = std::fs::read(dir.path().join("dev").join("berth-git-app.json")).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["filename"], "subdirA/subdirB/okteto.yml");
    }

    #[tokio::test]
    async fn get_missing_returns_none_and_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPipelineStore::new(dir.path(), "dev").unwrap();
        assert!(store.get("ghost").await.unwrap().is_none());
        store.delete("ghost").await.unwrap();

        store.put("app", &record("app", "")).await.unwrap();
        store.delete("app").await.unwrap();
        assert!(store.get("app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_document_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPipelineStore::new(dir.path(), "dev").unwrap();
        std::fs::write(dir.path().join("dev").join("berth-git-app.json"), b"{not json").unwrap();
        let err = store.get("app").await.unwrap_err();
        assert!(matches!(err, StorageError::Read { .. }));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FsPipelineStore::new(dir.path(), "dev").unwrap();
        let prod = FsPipelineStore::new(dir.path(), "prod").unwrap();
        dev.put("app", &record("app", "")).await.unwrap();
        assert!(prod.get("app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn index_register_then_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let index = FsArtifactIndex::new(dir.path()).unwrap();
        let digest = ImageDigest::from_bytes(b"image");
        let image = ImageReference::parse("registry.local/dev/app:berth")
            .unwrap()
            .with_digest(digest.clone());

        let err = index
            .resolve_digest("registry.local/dev/app:berth")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        index
            .register(&image, &["VERSION=1".to_string()])
            .await
            .unwrap();
        let got = index
            .resolve_digest("registry.local/dev/app:berth")
            .await
            .unwrap();
        assert_eq!(got, digest);

        // Survives a reopen.
        let reopened = FsArtifactIndex::new(dir.path()).unwrap();
        assert_eq!(
            reopened
                .resolve_digest("registry.local/dev/app:berth")
                .await
                .unwrap(),
            digest
        );
    }

    #[tokio::test]
    async fn index_rejects_unresolved_images() {
        let dir = tempfile::tempdir().unwrap();
        let index = FsArtifactIndex::new(dir.path()).unwrap();
        let image = ImageReference::parse("registry.local/app:dev").unwrap();
        assert!(index.register(&image, &[]).await.is_err());
    }
}
