//! In-memory collaborators for tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use berth_state::{ImageDigest, ImageReference};

use crate::builder::{built_reference, BuildRequest, ImageBuilder};
use crate::deployer::{Deployer, RenderedManifest, TeardownRequest};
use crate::domain::{BuildError, DeployerError};

// ---------------------------------------------------------------------------
// FakeImageBuilder
// ---------------------------------------------------------------------------

/// Image builder that records requests and fabricates digests.
#[derive(Debug, Default)]
pub struct FakeImageBuilder {
    builds: AtomicUsize,
    requests: Mutex<Vec<BuildRequest>>,
    failure: Mutex<Option<String>>,
    failing_components: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of builds started.
    pub fn build_calls(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Requests received, in call order.
    pub fn requests(&self) -> Vec<BuildRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Names of components built, in call order.
    pub fn built_components(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| r.component)
            .collect()
    }

    /// Fail every subsequent build.
    pub fn fail_builds(&self, reason: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(reason.into());
    }

    /// Fail builds of one component only.
    pub fn fail_component(&self, component: impl Into<String>) {
        self.failing_components
            .lock()
            .unwrap()
            .insert(component.into());
    }

    /// Sleep before finishing each build.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }
}

#[async_trait]
impl ImageBuilder for FakeImageBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<ImageReference, BuildError> {
        let n = self.builds.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failure.lock().unwrap().clone();
        if let Some(reason) = failure {
            return Err(BuildError::Other(reason));
        }
        if self
            .failing_components
            .lock()
            .unwrap()
            .contains(&request.component)
        {
            return Err(BuildError::CommandFailed {
                exit_code: 1,
                stderr: format!("build of {} failed", request.component),
            });
        }

        let digest = ImageDigest::from_bytes(format!("{}#{n}", request.component).as_bytes());
        built_reference(request, digest)
    }
}

// ---------------------------------------------------------------------------
// FakeDeployer
// ---------------------------------------------------------------------------

/// Deployer that captures what it was asked to apply and tear down.
#[derive(Debug, Default)]
pub struct FakeDeployer {
    applied: Mutex<Vec<RenderedManifest>>,
    torn_down: Mutex<Vec<TeardownRequest>>,
    apply_failure: Mutex<Option<String>>,
    teardown_failure: Mutex<Option<String>>,
}

impl FakeDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<RenderedManifest> {
        self.applied.lock().unwrap().clone()
    }

    pub fn torn_down(&self) -> Vec<TeardownRequest> {
        self.torn_down.lock().unwrap().clone()
    }

    pub fn fail_apply(&self, reason: impl Into<String>) {
        *self.apply_failure.lock().unwrap() = Some(reason.into());
    }

    pub fn fail_teardown(&self, reason: impl Into<String>) {
        *self.teardown_failure.lock().unwrap() = Some(reason.into());
    }

    /// Clear injected failures.
    pub fn heal(&self) {
        *self.apply_failure.lock().unwrap() = None;
        *self.teardown_failure.lock().unwrap() = None;
    }
}

#[async_trait]
impl Deployer for FakeDeployer {
    async fn apply(&self, manifest: &RenderedManifest) -> Result<(), DeployerError> {
        if let Some(reason) = self.apply_failure.lock().unwrap().clone() {
            return Err(DeployerError::Other(reason));
        }
        self.applied.lock().unwrap().push(manifest.clone());
        Ok(())
    }

    async fn teardown(&self, request: &TeardownRequest) -> Result<(), DeployerError> {
        if let Some(reason) = self.teardown_failure.lock().unwrap().clone() {
            return Err(DeployerError::Other(reason));
        }
        self.torn_down.lock().unwrap().push(request.clone());
        Ok(())
    }
}
