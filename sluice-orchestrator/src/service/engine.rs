//! Pipeline Engine
//!
//! Drives one run through clone, build-push and deploy, strictly in order.
//! Every stage transition is written to the registry before the next stage
//! starts, so a restarted orchestrator can tell a stage that never started
//! from one that failed or finished.

use sluice_core::domain::error::ErrorKind;
use sluice_core::domain::run::{Run, RunFailure, RunStatus};
use sluice_core::domain::task::TaskRun;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::executor::{Stages, TaskContext};
use crate::repository::{RegistryError, RunRegistry};
use crate::workspace::{Workspace, WorkspaceError, WorkspaceManager};

/// Sequences the stages of a run and records their outcome
pub struct PipelineEngine {
    registry: Arc<dyn RunRegistry>,
    workspaces: Arc<WorkspaceManager>,
    stages: Stages,
}

impl PipelineEngine {
    pub fn new(
        registry: Arc<dyn RunRegistry>,
        workspaces: Arc<WorkspaceManager>,
        stages: Stages,
    ) -> Self {
        Self {
            registry,
            workspaces,
            stages,
        }
    }

    /// Executes a `Pending` run to a terminal status
    ///
    /// Stage failures are recorded on the run, not returned; an `Err` means
    /// the registry itself could not be read or written.
    pub async fn run(
        &self,
        id: Uuid,
        cancel: CancellationToken,
    ) -> Result<RunStatus, RegistryError> {
        let run = self
            .registry
            .get(id)
            .await?
            .ok_or(RegistryError::NotFound(id))?;

        if run.status != RunStatus::Pending {
            return Err(RegistryError::InvalidState(format!(
                "run {} is {}, expected Pending",
                id, run.status
            )));
        }

        if cancel.is_cancelled() {
            info!("Run {} cancelled before start", id);
            self.registry.finish(id, RunStatus::Cancelled, None).await?;
            return Ok(RunStatus::Cancelled);
        }

        self.registry.mark_running(id).await?;
        info!(
            "Run {} started: {} at {}",
            id, run.source.repository, run.source.revision
        );

        let workspace = match self.workspaces.acquire(id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                let kind = match e {
                    WorkspaceError::Exhausted { .. } => ErrorKind::ResourceExhausted,
                    _ => ErrorKind::Internal,
                };
                warn!("Run {} could not get a workspace: {}", id, e);
                let failure = RunFailure {
                    task: None,
                    kind,
                    detail: e.to_string(),
                };
                self.registry
                    .finish(id, RunStatus::Failed, Some(failure))
                    .await?;
                return Ok(RunStatus::Failed);
            }
        };

        let outcome = self.execute_stages(&run, &workspace, cancel).await;

        // Released before the terminal status is written, on every path
        if let Err(e) = self.workspaces.release(workspace).await {
            warn!("Failed to release workspace of run {}: {}", id, e);
        }

        let (status, failure) = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!("Run {} aborted on registry error: {}", id, e);
                (
                    RunStatus::Failed,
                    Some(RunFailure {
                        task: None,
                        kind: ErrorKind::Internal,
                        detail: e.to_string(),
                    }),
                )
            }
        };

        self.registry.finish(id, status, failure.clone()).await?;

        match &failure {
            Some(f) => info!(
                "Run {} finished {}: {} at {} ({})",
                id,
                status,
                f.kind,
                f.task.map(|t| t.as_str()).unwrap_or("admission"),
                f.detail
            ),
            None => info!("Run {} finished {}", id, status),
        }

        Ok(status)
    }

    /// Runs the stages in order, stopping at the first failure or cancellation
    async fn execute_stages(
        &self,
        run: &Run,
        workspace: &Workspace,
        cancel: CancellationToken,
    ) -> Result<(RunStatus, Option<RunFailure>), RegistryError> {
        let mut ctx = TaskContext::for_run(run, cancel);

        for (kind, executor) in self.stages.ordered() {
            if ctx.cancel.is_cancelled() {
                info!("Run {} cancelled before {}", run.id, kind);
                return Ok((RunStatus::Cancelled, None));
            }

            let mut task = TaskRun::started(kind);
            self.registry.record_task(run.id, &task).await?;

            match executor.execute(workspace, &mut ctx).await {
                Ok(output) => {
                    self.registry
                        .record_artifacts(
                            run.id,
                            ctx.resolved_commit.as_deref(),
                            ctx.image_digest.as_deref(),
                        )
                        .await?;

                    task.attempts = output.attempts;
                    task.succeed(output.result);
                    self.registry.record_task(run.id, &task).await?;
                }
                Err(e) => {
                    task.attempts = e.attempts;
                    task.fail(e.kind, e.detail.clone());
                    self.registry.record_task(run.id, &task).await?;

                    if e.kind == ErrorKind::Cancelled {
                        info!("Run {} cancelled during {}", run.id, kind);
                        return Ok((RunStatus::Cancelled, None));
                    }

                    return Ok((
                        RunStatus::Failed,
                        Some(RunFailure {
                            task: Some(kind),
                            kind: e.kind,
                            detail: e.detail,
                        }),
                    ));
                }
            }
        }

        Ok((RunStatus::Succeeded, None))
    }
}
