//! Run DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::ErrorKind;
use crate::domain::run::{Run, RunStatus};
use crate::domain::task::TaskKind;

/// Request to trigger a run manually, bypassing the webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRun {
    /// Repository clone URL; defaults to the configured repository when absent
    pub repository: Option<String>,
    /// Branch, tag or commit to build
    pub revision: String,
    /// Explicit image tag; defaults to the resolved commit
    pub tag: Option<String>,
}

/// Condensed view of a run for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub status: RunStatus,
    pub repository: String,
    pub revision: String,
    pub resolved_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_task: Option<TaskKind>,
    pub failure_kind: Option<ErrorKind>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            status: run.status,
            repository: run.source.repository.clone(),
            revision: run.source.revision.clone(),
            resolved_commit: run.resolved_commit.clone(),
            created_at: run.created_at,
            completed_at: run.completed_at,
            failed_task: run.failure.as_ref().and_then(|f| f.task),
            failure_kind: run.failure.as_ref().map(|f| f.kind),
        }
    }
}
