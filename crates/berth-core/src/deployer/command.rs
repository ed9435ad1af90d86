//! Shell command deployer.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{DeployCommand, Deployer, RenderedManifest, TeardownRequest};
use crate::domain::DeployerError;

/// Output of one executed command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub name: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Mount point of the manifest directory inside a deploy image.
pub const CONTAINER_WORKDIR: &str = "/work";

/// Runs manifest commands with `sh -c` in the manifest directory.
///
/// When the manifest names a deploy image, each command runs in a fresh
/// container of that image instead, with the manifest directory mounted at
/// [`CONTAINER_WORKDIR`] and the rendered environment forwarded.
/// Commands run sequentially; the first failure stops the sequence.
#[derive(Debug, Clone)]
pub struct CommandDeployer {
    pub shell: String,
    /// Container CLI used for deploy images
    pub docker_binary: String,
    /// Per-command timeout; zero disables it
    pub timeout_secs: u64,
}

impl Default for CommandDeployer {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            docker_binary: "docker".to_string(),
            timeout_secs: 0,
        }
    }
}

impl CommandDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_docker_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker_binary = binary.into();
        self
    }

    /// Program and arguments that run `cmd`, on the host or in `image`.
    ///
    /// Container runs pass variable names only (`--env KEY`); the values come
    /// from the environment of the spawned CLI process.
    pub fn command_line(
        &self,
        cmd: &DeployCommand,
        dir: &Path,
        env: &BTreeMap<String, String>,
        image: Option<&str>,
    ) -> (String, Vec<String>) {
        let Some(image) = image else {
            return (
                self.shell.clone(),
                vec!["-c".to_string(), cmd.command.clone()],
            );
        };

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--volume".to_string(),
            format!("{}:{CONTAINER_WORKDIR}", dir.display()),
            "--workdir".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];
        for key in env.keys() {
            args.push("--env".to_string());
            args.push(key.clone());
        }
        args.push(image.to_string());
        args.push(self.shell.clone());
        args.push("-c".to_string());
        args.push(cmd.command.clone());
        (self.docker_binary.clone(), args)
    }

    /// Execute a single command.
    pub async fn run_command(
        &self,
        cmd: &DeployCommand,
        dir: &Path,
        env: &BTreeMap<String, String>,
        image: Option<&str>,
    ) -> Result<CommandResult, DeployerError> {
        let start = Instant::now();
        debug!(name = %cmd.name, dir = %dir.display(), image = ?image, "running command");

        let (program, args) = self.command_line(cmd, dir, env, image);
        let child = Command::new(program)
            .args(&args)
            .current_dir(dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeployerError::Spawn {
                name: cmd.name.clone(),
                source,
            })?;

        let wait = child.wait_with_output();
        let output = if self.timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(self.timeout_secs), wait)
                .await
                .map_err(|_| DeployerError::Timeout {
                    name: cmd.name.clone(),
                    timeout_secs: self.timeout_secs,
                })?
        } else {
            wait.await
        }
        .map_err(|source| DeployerError::Spawn {
            name: cmd.name.clone(),
            source,
        })?;

        let result = CommandResult {
            name: cmd.name.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if !output.status.success() {
            return Err(DeployerError::CommandFailed {
                name: result.name,
                exit_code: result.exit_code,
                stderr: result.stderr.trim_end().to_string(),
            });
        }
        info!(name = %result.name, duration_ms = result.duration_ms, "command succeeded");
        Ok(result)
    }

    async fn run_all(
        &self,
        commands: &[DeployCommand],
        dir: &Path,
        env: &BTreeMap<String, String>,
        image: Option<&str>,
    ) -> Result<Vec<CommandResult>, DeployerError> {
        let mut results = Vec::with_capacity(commands.len());
        for cmd in commands {
            results.push(self.run_command(cmd, dir, env, image).await?);
        }
        Ok(results)
    }
}

#[async_trait]
impl Deployer for CommandDeployer {
    async fn apply(&self, manifest: &RenderedManifest) -> Result<(), DeployerError> {
        self.run_all(
            &manifest.commands,
            &manifest.manifest_dir,
            &manifest.env,
            manifest.deploy_image.as_deref(),
        )
        .await
            .map(|_| ())
    }

    async fn teardown(&self, request: &TeardownRequest) -> Result<(), DeployerError> {
        self.run_all(
            &request.commands,
            &request.manifest_dir,
            &request.env,
            request.deploy_image.as_deref(),
        )
        .await
            .map(|_| ())
    }
}
