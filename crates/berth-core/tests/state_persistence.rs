//! Deploy state surviving process restarts through the on-disk backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_core::fakes::{FakeDeployer, FakeImageBuilder};
use berth_core::{BerthConfig, Coordinator, DeployRequest};
use berth_state::{FsArtifactIndex, FsPipelineStore, PipelineStore};
use tokio_util::sync::CancellationToken;

fn repo() -> (tempfile::TempDir, PathBuf) {
    let base = tempfile::tempdir().unwrap();
    let repo = base.path().join("movies");
    std::fs::create_dir_all(repo.join(".git")).unwrap();
    std::fs::write(
        repo.join("okteto.yml"),
        "name: movies\nbuild:\n  api:\n    context: api\n    image: registry.example.com/movies/api:dev\ndeploy:\n  - ./deploy.sh\n",
    )
    .unwrap();
    (base, repo)
}

/// A coordinator as a fresh process would build it from `state_dir`.
fn process(state_dir: &Path, builder: Arc<FakeImageBuilder>) -> (Coordinator, FsPipelineStore) {
    let config = BerthConfig::default().with_state_dir(state_dir);
    let registry = FsArtifactIndex::new(config.registry_dir()).unwrap();
    let store = FsPipelineStore::new(config.pipelines_dir(), &config.namespace).unwrap();
    let coordinator = Coordinator::new(
        config.coordinator_config(),
        Arc::new(registry),
        builder,
        Arc::new(FakeDeployer::new()),
        Arc::new(FsPipelineStore::new(config.pipelines_dir(), &config.namespace).unwrap()),
    );
    (coordinator, store)
}

#[tokio::test]
async fn second_process_skips_build_and_sees_record() {
    let (_base, repo) = repo();
    let state = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let builder = Arc::new(FakeImageBuilder::new());

    let (first, _) = process(state.path(), builder.clone());
    let deployed = first
        .deploy(&DeployRequest::new(&repo, "okteto.yml"), &cancel)
        .await
        .unwrap();
    drop(first);

    let (second, store) = process(state.path(), builder.clone());
    let outcome = second
        .deploy(&DeployRequest::new(repo.join("api"), "../okteto.yml"), &cancel)
        .await
        .unwrap();

    assert_eq!(builder.build_calls(), 1);
    assert_eq!(outcome.skipped(), vec!["api"]);
    assert_eq!(outcome.images["api"], deployed.images["api"]);
    assert_eq!(outcome.previous, deployed.record);

    let record = store.get("movies").await.unwrap().unwrap();
    assert_eq!(record.manifest_path, "okteto.yml");
}

#[tokio::test]
async fn destroy_in_later_process_removes_record_file() {
    let (_base, repo) = repo();
    let state = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let request = DeployRequest::new(&repo, "okteto.yml");

    let (first, _) = process(state.path(), Arc::new(FakeImageBuilder::new()));
    first.deploy(&request, &cancel).await.unwrap();

    let (second, store) = process(state.path(), Arc::new(FakeImageBuilder::new()));
    assert!(store.get("movies").await.unwrap().is_some());
    second.destroy(&request, &cancel).await.unwrap();
    assert!(store.get("movies").await.unwrap().is_none());
}
