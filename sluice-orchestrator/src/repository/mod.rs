//! Repository Module
//!
//! The run registry: durable record of every run and its TaskRuns, and the
//! single source of truth for queries.
//!
//! Two implementations share the transition rules defined here:
//! - `postgres`: sqlx-backed, used when `DATABASE_URL` is configured
//! - `memory`: process-local, used for development and tests

pub mod memory;
pub mod postgres;

pub use memory::MemoryRunRegistry;
pub use postgres::PgRunRegistry;

use async_trait::async_trait;
use chrono::Utc;
use sluice_core::domain::run::{Run, RunFailure, RunStatus};
use sluice_core::domain::task::{TaskKind, TaskRun};
use thiserror::Error;
use uuid::Uuid;

/// Registry error type
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistent store of runs
///
/// Reads may happen concurrently from anywhere. Writes for a given run only
/// ever come from the pipeline engine driving that run (or the scheduler
/// cancelling it before it started), so implementations serialize writes per
/// run rather than globally.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    /// Persist a newly admitted `Pending` run
    async fn create(&self, run: &Run) -> Result<(), RegistryError>;

    /// Fetch one run with its TaskRuns
    async fn get(&self, id: Uuid) -> Result<Option<Run>, RegistryError>;

    /// List runs newest first, optionally filtered by status
    async fn list(&self, status: Option<RunStatus>) -> Result<Vec<Run>, RegistryError>;

    /// Transition `Pending` -> `Running`
    async fn mark_running(&self, id: Uuid) -> Result<(), RegistryError>;

    /// Insert or update the TaskRun of a stage
    ///
    /// A new stage may only be appended in the fixed order and only after
    /// every earlier stage succeeded.
    async fn record_task(&self, id: Uuid, task: &TaskRun) -> Result<(), RegistryError>;

    /// Record stage artifacts on the run; `None` leaves a field untouched
    async fn record_artifacts(
        &self,
        id: Uuid,
        resolved_commit: Option<&str>,
        image_digest: Option<&str>,
    ) -> Result<(), RegistryError>;

    /// Move a run to a terminal status
    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        failure: Option<RunFailure>,
    ) -> Result<(), RegistryError>;
}

// =============================================================================
// Transition Rules
// =============================================================================

/// Applies `mark_running` to an in-memory run
pub(crate) fn apply_mark_running(run: &mut Run) -> Result<(), RegistryError> {
    if run.status != RunStatus::Pending {
        return Err(RegistryError::InvalidState(format!(
            "run {} cannot start from {}",
            run.id, run.status
        )));
    }
    run.status = RunStatus::Running;
    run.started_at = Some(Utc::now());
    Ok(())
}

/// Applies `record_task` to an in-memory run, returning the task's position
pub(crate) fn apply_record_task(run: &mut Run, task: &TaskRun) -> Result<usize, RegistryError> {
    if run.status != RunStatus::Running {
        return Err(RegistryError::InvalidState(format!(
            "run {} is {}; stages can only be recorded while running",
            run.id, run.status
        )));
    }

    let position = task.kind.position();

    if let Some(existing) = run.tasks.get(position) {
        if existing.kind != task.kind {
            return Err(RegistryError::InvalidState(format!(
                "run {} has {} at position {}",
                run.id, existing.kind, position
            )));
        }
        if existing.status.is_terminal() {
            return Err(RegistryError::InvalidState(format!(
                "stage {} of run {} is already {}",
                task.kind, run.id, existing.status
            )));
        }
        run.tasks[position] = task.clone();
        return Ok(position);
    }

    if position != run.tasks.len() {
        return Err(RegistryError::InvalidState(format!(
            "stage {} of run {} started out of order",
            task.kind, run.id
        )));
    }
    if let Some(previous) = run.tasks.iter().find(|t| t.status != RunStatus::Succeeded) {
        return Err(RegistryError::InvalidState(format!(
            "stage {} of run {} cannot start after {} is {}",
            task.kind, run.id, previous.kind, previous.status
        )));
    }

    run.tasks.push(task.clone());
    Ok(position)
}

/// Applies `record_artifacts` to an in-memory run
pub(crate) fn apply_artifacts(
    run: &mut Run,
    resolved_commit: Option<&str>,
    image_digest: Option<&str>,
) -> Result<(), RegistryError> {
    if run.is_terminal() {
        return Err(RegistryError::InvalidState(format!(
            "run {} is already {}",
            run.id, run.status
        )));
    }
    if let Some(commit) = resolved_commit {
        run.resolved_commit = Some(commit.to_string());
    }
    if let Some(digest) = image_digest {
        run.image_digest = Some(digest.to_string());
    }
    Ok(())
}

/// Applies `finish` to an in-memory run
pub(crate) fn apply_finish(
    run: &mut Run,
    status: RunStatus,
    failure: Option<RunFailure>,
) -> Result<(), RegistryError> {
    if !status.is_terminal() {
        return Err(RegistryError::InvalidState(format!(
            "{} is not a terminal status",
            status
        )));
    }
    if run.is_terminal() {
        return Err(RegistryError::InvalidState(format!(
            "run {} is already {}",
            run.id, run.status
        )));
    }
    if status == RunStatus::Succeeded
        && (run.tasks.len() != TaskKind::ORDER.len()
            || run.tasks.iter().any(|t| t.status != RunStatus::Succeeded))
    {
        return Err(RegistryError::InvalidState(format!(
            "run {} cannot succeed before every stage succeeded",
            run.id
        )));
    }
    run.status = status;
    run.completed_at = Some(Utc::now());
    run.failure = failure;
    Ok(())
}
