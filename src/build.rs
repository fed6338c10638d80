//! Container image build and publish
//!
//! Wraps the external `docker` binary for the three verbs the pipeline
//! needs: `build`, `login`, and `push`. Child output is streamed line by
//! line through our logging while the command runs, so a long build shows
//! progress instead of going dark.

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

/// Failure of a single toolchain invocation.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process ran and exited unsuccessfully.
    #[error("`{command}` exited with {status}")]
    Exited {
        /// The invocation, with secrets elided.
        command: String,
        /// Exit status reported by the toolchain.
        status: ExitStatus,
    },

    /// The process could not be spawned or its output could not be read.
    #[error("`{command}` could not run: {source}")]
    Io {
        /// The invocation, with secrets elided.
        command: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the build-and-publish step.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The deployment spec carries no build section.
    #[error("deployment spec has no build section")]
    MissingBuildSpec,

    /// `docker build` did not complete successfully.
    #[error("image build failed: {0}")]
    BuildFailed(#[source] CommandError),

    /// `docker login` did not complete successfully.
    #[error("registry login failed: {0}")]
    AuthFailed(#[source] CommandError),

    /// `docker push` did not complete successfully.
    #[error("image push failed: {0}")]
    PublishFailed(#[source] CommandError),
}

/// Contract for the external image toolchain.
///
/// One method per verb so the step logic can run against a mock in tests
/// without docker installed.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageToolchain: Send + Sync {
    /// Build `image` from a Dockerfile and context directory.
    async fn build(&self, image: &str, dockerfile: &Path, context: &Path)
        -> Result<(), BuildError>;

    /// Log in to the registry with the given credentials.
    async fn authenticate(
        &self,
        registry: &str,
        username: &str,
        password: &str,
    ) -> Result<(), BuildError>;

    /// Push the built image to its registry.
    async fn publish(&self, image: &str) -> Result<(), BuildError>;
}

/// Toolchain implementation that shells out to the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerCli {
    /// Toolchain using `docker` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_program(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Spawn the toolchain with the given args, streaming its output.
    ///
    /// `display` is the human-readable form of the invocation used in
    /// errors; callers elide credentials from it.
    async fn run(&self, display: String, args: Vec<String>) -> Result<(), CommandError> {
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A cancelled run drops this future mid-wait; the child must
            // not keep running detached.
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Io {
                command: display.clone(),
                source,
            })?;

        // docker writes build progress to stderr; surface it as it happens
        // rather than holding it back for a post-mortem.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("{}", line);
                }
            }
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.map_err(|source| CommandError::Io {
                command: display.clone(),
                source,
            })? {
                info!("{}", line);
            }
        }

        let status = child.wait().await.map_err(|source| CommandError::Io {
            command: display.clone(),
            source,
        })?;
        let _ = stderr_task.await;

        if !status.success() {
            return Err(CommandError::Exited {
                command: display,
                status,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImageToolchain for DockerCli {
    async fn build(
        &self,
        image: &str,
        dockerfile: &Path,
        context: &Path,
    ) -> Result<(), BuildError> {
        info!(image = %image, "building container image");
        let display = format!(
            "{} build -t {} -f {} {}",
            self.program,
            image,
            dockerfile.display(),
            context.display()
        );
        let args = vec![
            "build".to_string(),
            "-t".to_string(),
            image.to_string(),
            "-f".to_string(),
            dockerfile.display().to_string(),
            context.display().to_string(),
        ];
        self.run(display, args).await.map_err(BuildError::BuildFailed)
    }

    async fn authenticate(
        &self,
        registry: &str,
        username: &str,
        password: &str,
    ) -> Result<(), BuildError> {
        info!(registry = %registry, username = %username, "logging in to registry");
        let display = format!("{} login -u {} {}", self.program, username, registry);
        let args = vec![
            "login".to_string(),
            "-u".to_string(),
            username.to_string(),
            "-p".to_string(),
            password.to_string(),
            registry.to_string(),
        ];
        self.run(display, args).await.map_err(BuildError::AuthFailed)
    }

    async fn publish(&self, image: &str) -> Result<(), BuildError> {
        info!(image = %image, "pushing container image");
        let display = format!("{} push {}", self.program, image);
        let args = vec!["push".to_string(), image.to_string()];
        self.run(display, args).await.map_err(BuildError::PublishFailed)
    }
}
