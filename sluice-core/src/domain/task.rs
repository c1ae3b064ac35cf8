//! TaskRun domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::ErrorKind;
use crate::domain::run::RunStatus;

/// The three stages of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    #[serde(rename = "clone")]
    Clone,
    #[serde(rename = "build-push")]
    BuildPush,
    #[serde(rename = "deploy")]
    Deploy,
}

impl TaskKind {
    /// Fixed execution order
    pub const ORDER: [TaskKind; 3] = [TaskKind::Clone, TaskKind::BuildPush, TaskKind::Deploy];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Clone => "clone",
            TaskKind::BuildPush => "build-push",
            TaskKind::Deploy => "deploy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|kind| kind.as_str() == s)
    }

    /// Position in the fixed execution order
    pub fn position(self) -> usize {
        match self {
            TaskKind::Clone => 0,
            TaskKind::BuildPush => 1,
            TaskKind::Deploy => 2,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution record of one stage within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub kind: TaskKind,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of attempts made; only build-push ever exceeds one
    pub attempts: u32,
    /// Stage output: resolved commit, pushed digest, rollout outcome
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
}

impl TaskRun {
    /// A record for a stage that has just started
    pub fn started(kind: TaskKind) -> Self {
        Self {
            kind,
            status: RunStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            attempts: 0,
            result: None,
            error: None,
        }
    }

    pub fn succeed(&mut self, result: serde_json::Value) {
        self.status = RunStatus::Succeeded;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn fail(&mut self, kind: ErrorKind, detail: impl Into<String>) {
        self.status = if kind == ErrorKind::Cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        self.completed_at = Some(Utc::now());
        self.error = Some(TaskFailure {
            kind,
            detail: detail.into(),
        });
    }
}

/// Failure recorded on a TaskRun
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub detail: String,
}
