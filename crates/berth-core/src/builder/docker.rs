//! `docker buildx` backed image builder.

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use berth_state::{ImageDigest, ImageReference};
use tokio::process::Command;
use tracing::{debug, info};

use super::{built_reference, BuildRequest, ImageBuilder};
use crate::domain::BuildError;

/// Keep the tail of stderr in errors; buildx progress output is long.
const STDERR_TAIL: usize = 4096;

/// Builds images by shelling out to `docker buildx build`.
///
/// The image digest is read from the file passed via `--metadata-file`.
/// Tagged images are pushed unless `push` is disabled.
#[derive(Debug, Clone)]
pub struct DockerCliBuilder {
    pub binary: String,
    pub push: bool,
    pub platform: Option<String>,
}

impl Default for DockerCliBuilder {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            push: true,
            platform: None,
        }
    }
}

impl DockerCliBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Arguments passed to the docker binary for `request`.
    pub fn command_args(&self, request: &BuildRequest, metadata_file: &Path) -> Vec<String> {
        let mut args = vec![
            "buildx".to_string(),
            "build".to_string(),
            "--progress=plain".to_string(),
            "--file".to_string(),
            request.dockerfile.display().to_string(),
            "--metadata-file".to_string(),
            metadata_file.display().to_string(),
        ];

        if let Some(platform) = &self.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }

        match &request.tag {
            Some(tag) => {
                args.push("--tag".to_string());
                args.push(tag.clone());
                args.push(if self.push { "--push" } else { "--load" }.to_string());
            }
            None => args.push("--load".to_string()),
        }

        if request.no_cache {
            args.push("--no-cache".to_string());
        }
        for arg in &request.build_args {
            args.push("--build-arg".to_string());
            args.push(arg.clone());
        }
        for cache in &request.cache_from {
            args.push("--cache-from".to_string());
            args.push(cache.clone());
        }
        for cache in &request.export_cache {
            args.push("--cache-to".to_string());
            args.push(cache_to_spec(cache));
        }

        args.push(request.context.display().to_string());
        args
    }
}

/// Expand a bare reference into a registry cache export spec.
fn cache_to_spec(reference: &str) -> String {
    if reference.contains('=') {
        reference.to_string()
    } else {
        format!("type=registry,ref={reference},mode=max")
    }
}

/// Extract the image digest from a buildx metadata file.
///
/// Prefers `containerimage.digest` (manifest digest, what registries
/// report) and falls back to `containerimage.config.digest`.
pub fn parse_metadata(content: &str) -> Result<ImageDigest, BuildError> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| BuildError::Metadata(e.to_string()))?;
    let raw = value
        .get("containerimage.digest")
        .or_else(|| value.get("containerimage.config.digest"))
        .and_then(|v| v.as_str())
        .ok_or(BuildError::MissingDigest)?;
    raw.parse::<ImageDigest>()
        .map_err(|e| BuildError::Metadata(e.to_string()))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim_end();
    let start = text.len().saturating_sub(STDERR_TAIL);
    let start = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());
    text[start..].to_string()
}

#[async_trait]
impl ImageBuilder for DockerCliBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<ImageReference, BuildError> {
        let start = Instant::now();
        let metadata = tempfile::NamedTempFile::new().map_err(BuildError::Spawn)?;
        let args = self.command_args(request, metadata.path());
        debug!(component = %request.component, binary = %self.binary, ?args, "running image build");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BuildError::Spawn)?;
        let output = child.wait_with_output().await.map_err(BuildError::Spawn)?;

        if !output.status.success() {
            return Err(BuildError::CommandFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr: stderr_tail(&output.stderr),
            });
        }

        let content = tokio::fs::read_to_string(metadata.path())
            .await
            .map_err(|e| BuildError::Metadata(e.to_string()))?;
        let digest = parse_metadata(&content)?;
        info!(
            component = %request.component,
            digest = %digest,
            duration_ms = start.elapsed().as_millis() as u64,
            "image built"
        );
        built_reference(request, digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request(tag: Option<&str>) -> BuildRequest {
        BuildRequest {
            component: "api".to_string(),
            context: PathBuf::from("/repo/api"),
            dockerfile: PathBuf::from("/repo/api/Dockerfile"),
            tag: tag.map(str::to_string),
            build_args: vec!["GO_VERSION=1.22".to_string()],
            cache_from: vec!["reg.io/app/api:cache".to_string()],
            export_cache: vec!["reg.io/app/api:cache".to_string()],
            no_cache: false,
        }
    }

    #[test]
    fn tagged_build_pushes_and_passes_options() {
        let builder = DockerCliBuilder::new();
        let args = builder.command_args(&request(Some("reg.io/app/api:dev")), Path::new("/tmp/m.json"));
        let joined = args.join(" ");
        assert!(joined.starts_with("buildx build"));
        assert!(joined.contains("--tag reg.io/app/api:dev --push"));
        assert!(joined.contains("--metadata-file /tmp/m.json"));
        assert!(joined.contains("--build-arg GO_VERSION=1.22"));
        assert!(joined.contains("--cache-from reg.io/app/api:cache"));
        assert!(joined.contains("--cache-to type=registry,ref=reg.io/app/api:cache,mode=max"));
        assert_eq!(args.last().map(String::as_str), Some("/repo/api"));
    }

    #[test]
    fn untagged_build_loads_locally() {
        let builder = DockerCliBuilder::new().with_platform("linux/amd64");
        let args = builder.command_args(&request(None), Path::new("/tmp/m.json"));
        assert!(args.contains(&"--load".to_string()));
        assert!(!args.contains(&"--push".to_string()));
        assert!(!args.contains(&"--tag".to_string()));
        assert!(args.join(" ").contains("--platform linux/amd64"));
    }

    #[test]
    fn metadata_prefers_manifest_digest() {
        let manifest = format!("sha256:{}", "a".repeat(64));
        let config = format!("sha256:{}", "b".repeat(64));
        let json = format!(
            r#"{{"containerimage.config.digest":"{config}","containerimage.digest":"{manifest}"}}"#
        );
        assert_eq!(parse_metadata(&json).unwrap().as_str(), manifest);

        let json = format!(r#"{{"containerimage.config.digest":"{config}"}}"#);
        assert_eq!(parse_metadata(&json).unwrap().as_str(), config);
    }

    #[test]
    fn metadata_without_digest_is_an_error() {
        assert!(matches!(
            parse_metadata(r#"{"buildx.build.ref":"x"}"#),
            Err(BuildError::MissingDigest)
        ));
        assert!(matches!(parse_metadata("not json"), Err(BuildError::Metadata(_))));
    }

    #[test]
    fn stderr_tail_keeps_end() {
        let long = format!("{}END", "x".repeat(STDERR_TAIL * 2));
        let tail = stderr_tail(long.as_bytes());
        assert_eq!(tail.len(), STDERR_TAIL);
        assert!(tail.ends_with("END"));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let builder = DockerCliBuilder::new().with_binary("/nonexistent/berth-docker");
        let err = builder.build(&request(None)).await.unwrap_err();
        assert!(matches!(err, BuildError::Spawn(_)));
    }
}
