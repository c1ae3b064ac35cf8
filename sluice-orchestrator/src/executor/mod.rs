//! Task executors
//!
//! The three stages of a run (clone, build-push, deploy) behind one contract.
//! Each executor is a single step: it receives the run's workspace and a
//! context carrying the source reference, artifacts produced by earlier
//! stages, and the cancellation token; it returns its result payload or a
//! classified error.
//!
//! External capabilities (git, the container build tool, the deployment
//! platform) sit behind the traits in each submodule so they can be swapped
//! without touching the engine.

pub mod build_push;
pub mod clone;
pub mod command;
pub mod deploy;

#[cfg(test)]
pub mod testing;

pub use build_push::{BuildPushTask, ImageBuilder, PodmanBuilder, RegistryCredential, RetryPolicy};
pub use clone::{CloneTask, GitFetcher, SourceFetcher};
pub use deploy::{DeployTask, DeploymentTarget, KubectlTarget, RolloutStatus};

use async_trait::async_trait;
use sluice_core::domain::error::ErrorKind;
use sluice_core::domain::run::{ImageRef, Run, SourceRef};
use sluice_core::domain::task::TaskKind;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::workspace::Workspace;

/// Classified stage failure
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub detail: String,
    /// Attempts made before giving up
    pub attempts: u32,
}

impl TaskError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            attempts: 1,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run cancelled")
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Successful stage output
#[derive(Debug, Clone)]
pub struct TaskOutput {
    /// Payload stored on the TaskRun
    pub result: serde_json::Value,
    pub attempts: u32,
}

impl TaskOutput {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            attempts: 1,
        }
    }
}

/// State threaded through the stages of one run
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: Uuid,
    pub source: SourceRef,
    pub image: ImageRef,
    /// Set by clone, consumed by build-push
    pub resolved_commit: Option<String>,
    /// Set by build-push, consumed by deploy
    pub image_digest: Option<String>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn for_run(run: &Run, cancel: CancellationToken) -> Self {
        Self {
            run_id: run.id,
            source: run.source.clone(),
            image: run.image.clone(),
            resolved_commit: run.resolved_commit.clone(),
            image_digest: run.image_digest.clone(),
            cancel,
        }
    }

    /// Cooperative cancellation point
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            Err(TaskError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// One stage of a run
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs the stage inside `workspace`
    ///
    /// Implementations check `ctx.checkpoint()` on entry and at each internal
    /// wait, and write the artifact they produce back into `ctx`.
    async fn execute(
        &self,
        workspace: &Workspace,
        ctx: &mut TaskContext,
    ) -> Result<TaskOutput, TaskError>;
}

/// The executors for clone, build-push and deploy
#[derive(Clone)]
pub struct Stages {
    clone: Arc<dyn TaskExecutor>,
    build_push: Arc<dyn TaskExecutor>,
    deploy: Arc<dyn TaskExecutor>,
}

impl Stages {
    pub fn new(
        clone: Arc<dyn TaskExecutor>,
        build_push: Arc<dyn TaskExecutor>,
        deploy: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            clone,
            build_push,
            deploy,
        }
    }

    /// Executors paired with their kind, in the fixed execution order
    pub fn ordered(&self) -> [(TaskKind, &Arc<dyn TaskExecutor>); 3] {
        [
            (TaskKind::Clone, &self.clone),
            (TaskKind::BuildPush, &self.build_push),
            (TaskKind::Deploy, &self.deploy),
        ]
    }
}
