//! Startup recovery
//!
//! Runs found mid-flight when the orchestrator starts were interrupted by a
//! restart. Their stages cannot be resumed (the workspace is gone), so:
//!
//! 1. `Running` runs are failed as `Internal`, closing the open TaskRun
//! 2. stale workspace directories are swept
//! 3. `Pending` runs are queued again in creation order

use sluice_core::domain::error::ErrorKind;
use sluice_core::domain::run::{RunFailure, RunStatus};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::scheduler::RunScheduler;
use crate::repository::{RegistryError, RunRegistry};
use crate::workspace::WorkspaceManager;

pub const INTERRUPTED: &str = "interrupted by orchestrator restart";

/// What recovery did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed: Vec<Uuid>,
    pub requeued: Vec<Uuid>,
    pub swept_workspaces: usize,
}

pub async fn recover(
    registry: &Arc<dyn RunRegistry>,
    workspaces: &WorkspaceManager,
    scheduler: &RunScheduler,
) -> Result<RecoveryReport, RegistryError> {
    let mut report = RecoveryReport::default();

    for run in registry.list(Some(RunStatus::Running)).await? {
        let open_task = run
            .tasks
            .iter()
            .find(|t| !t.status.is_terminal())
            .cloned();

        if let Some(mut task) = open_task.clone() {
            task.fail(ErrorKind::Internal, INTERRUPTED);
            registry.record_task(run.id, &task).await?;
        }

        registry
            .finish(
                run.id,
                RunStatus::Failed,
                Some(RunFailure {
                    task: open_task.map(|t| t.kind),
                    kind: ErrorKind::Internal,
                    detail: INTERRUPTED.to_string(),
                }),
            )
            .await?;

        warn!("Run {} was interrupted by a restart; marked Failed", run.id);
        report.failed.push(run.id);
    }

    match workspaces.sweep().await {
        Ok(swept) => report.swept_workspaces = swept,
        Err(e) => warn!("Workspace sweep failed: {}", e),
    }

    // list() is newest first
    let mut pending = registry.list(Some(RunStatus::Pending)).await?;
    pending.reverse();
    report.requeued = pending.iter().map(|run| run.id).collect();

    if !report.requeued.is_empty() {
        scheduler.enqueue_existing(report.requeued.clone()).await;
    }

    info!(
        "Recovery complete: {} failed, {} requeued, {} workspace(s) swept",
        report.failed.len(),
        report.requeued.len(),
        report.swept_workspaces
    );

    Ok(report)
}
