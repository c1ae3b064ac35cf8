//! Build-and-push stage
//!
//! Builds the image from the descriptor in the cloned tree, tags it with an
//! immutable tag (explicit or the resolved commit) and pushes it. Only the push
//! is retried: a failing build will not fix itself, a registry hiccup might.

use async_trait::async_trait;
use serde_json::json;
use sluice_core::domain::error::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::command::ExternalCommand;
use super::{TaskContext, TaskError, TaskExecutor, TaskOutput};
use crate::workspace::Workspace;

/// Descriptor names probed when none is configured
const DEFAULT_DESCRIPTORS: [&str; 2] = ["Containerfile", "Dockerfile"];

/// Registry login material
///
/// Only ever handed to the push; never logged or stored on a run.
#[derive(Clone)]
pub struct RegistryCredential {
    pub server: String,
    pub username: String,
    pub token: String,
}

impl std::fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Builds and publishes container images
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds `image` (a full `repository:tag`) from `descriptor` in `context`
    async fn build(&self, context: &Path, descriptor: &Path, image: &str)
    -> Result<(), TaskError>;

    /// Pushes `image` and returns its content digest
    ///
    /// `scratch` is a run-private directory for login state.
    async fn push(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
        scratch: &Path,
    ) -> Result<String, TaskError>;
}

/// `ImageBuilder` driving the podman (or docker-compatible) CLI
#[derive(Debug, Clone)]
pub struct PodmanBuilder {
    bin: String,
    timeout: Duration,
}

impl PodmanBuilder {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    fn command(&self) -> ExternalCommand {
        ExternalCommand::new(&self.bin).timeout(self.timeout)
    }
}

#[async_trait]
impl ImageBuilder for PodmanBuilder {
    async fn build(
        &self,
        context: &Path,
        descriptor: &Path,
        image: &str,
    ) -> Result<(), TaskError> {
        let output = self
            .command()
            .args(["build", "--file"])
            .arg(descriptor.to_string_lossy())
            .args(["--tag", image])
            .arg(context.to_string_lossy())
            .run()
            .await
            .map_err(|e| TaskError::new(ErrorKind::BuildFailed, e.to_string()))?;

        if !output.success() {
            return Err(TaskError::new(
                ErrorKind::BuildFailed,
                format!(
                    "build exited with {}: {}",
                    output.exit_code,
                    output.stderr_tail(10)
                ),
            ));
        }
        Ok(())
    }

    async fn push(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
        scratch: &Path,
    ) -> Result<String, TaskError> {
        let authfile = scratch.join("auth.json");
        let digestfile = scratch.join("digest");

        if let Some(credential) = credential {
            let login = self
                .command()
                .arg("login")
                .arg("--authfile")
                .arg(authfile.to_string_lossy())
                .args(["--username", credential.username.as_str()])
                .arg("--password-stdin")
                .arg(&credential.server)
                .stdin(credential.token.clone())
                .run()
                .await
                .map_err(|e| TaskError::new(ErrorKind::PushFailed, e.to_string()))?;

            if !login.success() {
                return Err(TaskError::new(
                    ErrorKind::PushFailed,
                    format!(
                        "registry login to {} failed: {}",
                        credential.server,
                        login.stderr_tail(3)
                    ),
                ));
            }
        }

        let mut push = self.command().arg("push");
        if credential.is_some() {
            push = push.arg("--authfile").arg(authfile.to_string_lossy());
        }
        let output = push
            .arg("--digestfile")
            .arg(digestfile.to_string_lossy())
            .arg(image)
            .run()
            .await
            .map_err(|e| TaskError::new(ErrorKind::PushFailed, e.to_string()))?;

        if !output.success() {
            return Err(TaskError::new(
                ErrorKind::PushFailed,
                format!(
                    "push exited with {}: {}",
                    output.exit_code,
                    output.stderr_tail(5)
                ),
            ));
        }

        let digest = tokio::fs::read_to_string(&digestfile)
            .await
            .map_err(|e| TaskError::internal(format!("push reported no digest: {}", e)))?;
        let digest = digest.trim().to_string();
        if digest.is_empty() {
            return Err(TaskError::internal("push reported an empty digest"));
        }
        Ok(digest)
    }
}

/// Bounded exponential backoff for the push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// The build-and-push stage
pub struct BuildPushTask {
    builder: Arc<dyn ImageBuilder>,
    credential: Option<RegistryCredential>,
    descriptor: Option<String>,
    retry: RetryPolicy,
}

impl BuildPushTask {
    pub fn new(
        builder: Arc<dyn ImageBuilder>,
        credential: Option<RegistryCredential>,
        descriptor: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            builder,
            credential,
            descriptor,
            retry,
        }
    }

    /// Locates the build descriptor in the cloned tree
    fn find_descriptor(&self, source_dir: &Path) -> Result<PathBuf, TaskError> {
        let candidates: Vec<&str> = match &self.descriptor {
            Some(name) => vec![name.as_str()],
            None => DEFAULT_DESCRIPTORS.to_vec(),
        };

        candidates
            .iter()
            .map(|name| source_dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                TaskError::new(
                    ErrorKind::BuildFailed,
                    format!("no build descriptor found (looked for {})", candidates.join(", ")),
                )
            })
    }

    /// Pushes with retry, honouring cancellation between attempts
    async fn push_with_retry(
        &self,
        image: &str,
        scratch: &Path,
        ctx: &TaskContext,
    ) -> Result<(String, u32), TaskError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self
                .builder
                .push(image, self.credential.as_ref(), scratch)
                .await
            {
                Ok(digest) => return Ok((digest, attempt)),
                Err(e) if e.kind.is_retryable() && attempt <= self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "Push of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        image,
                        attempt,
                        self.retry.max_retries + 1,
                        delay,
                        e.detail
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => {
                            return Err(TaskError::cancelled().with_attempts(attempt));
                        }
                    }
                    ctx.checkpoint().map_err(|e| e.with_attempts(attempt))?;
                }
                Err(e) => return Err(e.with_attempts(attempt)),
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for BuildPushTask {
    async fn execute(
        &self,
        workspace: &Workspace,
        ctx: &mut TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        ctx.checkpoint()?;

        let commit = ctx
            .resolved_commit
            .clone()
            .ok_or_else(|| TaskError::internal("build started without a resolved commit"))?;

        let source_dir = workspace.source_dir();
        let descriptor = self.find_descriptor(&source_dir)?;
        let tag = ctx.image.effective_tag(&commit).to_string();
        let image = ctx.image.tagged(&tag);

        info!("Building {} for run {}", image, ctx.run_id);
        debug!("Build descriptor: {}", descriptor.display());

        self.builder.build(&source_dir, &descriptor, &image).await?;

        ctx.checkpoint()?;

        let (digest, attempts) = self
            .push_with_retry(&image, workspace.path(), ctx)
            .await?;

        info!(
            "Pushed {} as {} for run {} after {} attempt(s)",
            image, digest, ctx.run_id, attempts
        );

        ctx.image_digest = Some(digest.clone());

        Ok(TaskOutput {
            result: json!({
                "image": image,
                "tag": tag,
                "digest": digest,
            }),
            attempts,
        })
    }
}
