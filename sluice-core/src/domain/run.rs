//! Run domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::error::ErrorKind;
use crate::domain::task::{TaskKind, TaskRun};

/// One end-to-end clone/build/deploy execution for a single source revision
///
/// Structure shared between orchestrator (persists and mutates) and the
/// client/CLI (reads).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub source: SourceRef,
    pub image: ImageRef,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Stage records in execution order; a stage that never started has none
    pub tasks: Vec<TaskRun>,
    /// Commit the clone stage pinned the run to
    pub resolved_commit: Option<String>,
    /// Content digest of the pushed image
    pub image_digest: Option<String>,
    pub failure: Option<RunFailure>,
}

impl Run {
    /// Creates a new `Pending` run with a fresh id
    pub fn new(source: SourceRef, image: ImageRef, trigger: RunTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            image,
            trigger,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            tasks: Vec::new(),
            resolved_commit: None,
            image_digest: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The record for a given stage, if that stage started
    pub fn task(&self, kind: TaskKind) -> Option<&TaskRun> {
        self.tasks.iter().find(|t| t.kind == kind)
    }
}

/// Run execution status
///
/// TaskRuns reuse this enum for their own status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        }
    }

    /// Parse a status name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to be admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTrigger {
    /// A signed push webhook with the given delivery id
    Webhook { delivery_id: String },
    /// An operator trigger through the admin API or CLI
    Manual,
}

/// Source reference a run builds from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Clone URL of the repository
    pub repository: String,
    /// Branch name, tag or commit
    pub revision: String,
}

/// Target image coordinate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Registry and name, e.g. `registry.example.com/team/app`
    pub repository: String,
    /// Explicit tag; when absent the resolved commit is used
    pub tag: Option<String>,
}

impl ImageRef {
    /// The tag this image is pushed under, falling back to the resolved commit
    pub fn effective_tag<'a>(&'a self, resolved_commit: &'a str) -> &'a str {
        self.tag.as_deref().unwrap_or(resolved_commit)
    }

    /// `repository:tag`
    pub fn tagged(&self, tag: &str) -> String {
        format!("{}:{}", self.repository, tag)
    }

    /// `repository@digest`, immutable reference used for deployment
    pub fn pinned(&self, digest: &str) -> String {
        format!("{}@{}", self.repository, digest)
    }
}

/// Why a run failed: the failing stage (if any had started), its kind and detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub task: Option<TaskKind>,
    pub kind: ErrorKind,
    pub detail: String,
}
