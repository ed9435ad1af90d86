//! Trait contract tests for PipelineStore and ArtifactRegistry.
//!
//! These tests verify the behavioral contracts of the storage traits
//! against every backend shipped in this crate. Any conforming
//! implementation must pass these.

use std::collections::BTreeMap;

use berth_state::fakes::{MemoryArtifactRegistry, MemoryPipelineStore};
use berth_state::storage_traits::*;
use berth_state::{FsArtifactIndex, FsPipelineStore, StorageError};
use chrono::Utc;

fn record(name: &str, manifest_path: &str) -> PipelineRecord {
    PipelineRecord {
        name: name.to_string(),
        manifest_path: manifest_path.to_string(),
        status: PipelineStatus::Deployed,
        repository: None,
        manifest_digest: None,
        images: BTreeMap::new(),
        updated_at: Utc::now(),
    }
}

// ===========================================================================
// PipelineStore contract tests
// ===========================================================================

async fn check_store_contract(store: &dyn PipelineStore) {
    // get on an unknown pipeline is None, not an error
    assert!(store.get("e2e-deploy-test").await.unwrap().is_none());

    // put then get round trip
    let first = record("e2e-deploy-test", "");
    store.put("e2e-deploy-test", &first).await.unwrap();
    assert_eq!(store.get("e2e-deploy-test").await.unwrap(), Some(first.clone()));

    // put is an upsert
    let second = record("e2e-deploy-test", "subdirA/okteto.yml");
    store.put("e2e-deploy-test", &second).await.unwrap();
    let got = store.get("e2e-deploy-test").await.unwrap().unwrap();
    assert_eq!(got.manifest_path, "subdirA/okteto.yml");

    // delete clears, and deleting again is fine
    store.delete("e2e-deploy-test").await.unwrap();
    assert!(store.get("e2e-deploy-test").await.unwrap().is_none());
    store.delete("e2e-deploy-test").await.unwrap();

    // invalid names are rejected on write
    let err = store.put("Not_Valid", &record("Not_Valid", "")).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidName { .. }));
}

#[tokio::test]
async fn memory_store_satisfies_contract() {
    check_store_contract(&MemoryPipelineStore::new()).await;
}

#[tokio::test]
async fn fs_store_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsPipelineStore::new(dir.path(), "dev").unwrap();
    check_store_contract(&store).await;
}

#[tokio::test]
async fn idempotent_upsert_keeps_a_single_record() {
    let store = MemoryPipelineStore::new();
    let rec = record("app", "subdirA/subdirB/okteto.yml");

    store.put("app", &rec).await.unwrap();
    store.put("app", &rec).await.unwrap();

    assert_eq!(store.len(), 1);
    assert_eq!(store.get("app").await.unwrap(), Some(rec));
}

#[tokio::test]
async fn failing_store_reports_write_error() {
    let store = MemoryPipelineStore::new();
    store.fail_writes("etcd unavailable");
    let err = store.put("app", &record("app", "")).await.unwrap_err();
    assert!(matches!(err, StorageError::Write { .. }));
    assert!(store.is_empty());
}

// ===========================================================================
// ArtifactRegistry contract tests
// ===========================================================================

async fn check_registry_contract(registry: &dyn ArtifactRegistry) {
    let tag = "registry.local/dev/app:dev";

    // absent tag → NotFound
    let err = registry.resolve_digest(tag).await.unwrap_err();
    assert!(err.is_not_found(), "expected NotFound, got {err:?}");

    // registering an unresolved reference is refused
    let unresolved = ImageReference::parse(tag).unwrap();
    assert!(registry.register(&unresolved, &[]).await.is_err());

    // register then resolve (read-your-writes)
    let digest = ImageDigest::from_bytes(b"app image v1");
    let image = unresolved.with_digest(digest.clone());
    registry
        .register(&image, &["KEY=value".to_string()])
        .await
        .unwrap();
    assert_eq!(registry.resolve_digest(tag).await.unwrap(), digest);

    // re-registering replaces the digest
    let digest2 = ImageDigest::from_bytes(b"app image v2");
    let image2 = ImageReference::parse(tag).unwrap().with_digest(digest2.clone());
    registry.register(&image2, &[]).await.unwrap();
    assert_eq!(registry.resolve_digest(tag).await.unwrap(), digest2);
}

#[tokio::test]
async fn memory_registry_satisfies_contract() {
    check_registry_contract(&MemoryArtifactRegistry::new()).await;
}

#[tokio::test]
async fn fs_index_satisfies_contract() {
    let dir = tempfile::tempdir().unwrap();
    let index = FsArtifactIndex::new(dir.path()).unwrap();
    check_registry_contract(&index).await;
}

#[tokio::test]
async fn memory_registry_keys_on_normalized_reference() {
    let registry = MemoryArtifactRegistry::new();
    let digest = registry
        .insert("nginx:1.25", ImageDigest::from_bytes(b"nginx"))
        .unwrap();
    assert_eq!(
        registry
            .resolve_digest("docker.io/library/nginx:1.25")
            .await
            .unwrap(),
        digest
    );
}

#[tokio::test]
async fn transient_failure_is_not_not_found() {
    let registry = MemoryArtifactRegistry::new();
    registry
        .insert("registry.local/app:dev", ImageDigest::from_bytes(b"a"))
        .unwrap();
    registry.fail_lookups("connection reset by peer");

    let err = registry
        .resolve_digest("registry.local/app:dev")
        .await
        .unwrap_err();
    assert!(!err.is_not_found());
    assert_eq!(registry.lookup_calls(), 1);

    registry.heal();
    assert!(registry.resolve_digest("registry.local/app:dev").await.is_ok());
}

#[tokio::test]
async fn registration_keeps_build_args() {
    let registry = MemoryArtifactRegistry::new();
    let image = ImageReference::parse("registry.local/app:dev")
        .unwrap()
        .with_digest(ImageDigest::from_bytes(b"built"));
    registry
        .register(&image, &["A=1".to_string(), "B=2".to_string()])
        .await
        .unwrap();

    let got = registry.registered("registry.local/app:dev").unwrap();
    assert_eq!(got.build_args, vec!["A=1", "B=2"]);
    assert_eq!(registry.register_calls(), 1);
}
