//! Failure taxonomy
//!
//! Every stage failure is recorded with one of these kinds and surfaced
//! unchanged on the run, so operators can act on the query surface alone.

use serde::{Deserialize, Serialize};

/// Classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing or invalid webhook signature
    Unauthorized,
    /// No workspace capacity left when the run started
    ResourceExhausted,
    /// Source host unreachable or credentials rejected during clone
    SourceUnavailable,
    /// The requested revision does not exist in the repository
    RevisionNotFound,
    /// The image build exited non-zero or the build descriptor is missing
    BuildFailed,
    /// The registry rejected or dropped the push
    PushFailed,
    /// The deployment did not become ready within the rollout timeout
    RolloutTimeout,
    /// The run was cancelled while the stage was in progress
    Cancelled,
    /// Orchestrator-side fault (registry, filesystem, restart)
    Internal,
}

impl ErrorKind {
    /// All kinds, in declaration order
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Unauthorized,
        ErrorKind::ResourceExhausted,
        ErrorKind::SourceUnavailable,
        ErrorKind::RevisionNotFound,
        ErrorKind::BuildFailed,
        ErrorKind::PushFailed,
        ErrorKind::RolloutTimeout,
        ErrorKind::Cancelled,
        ErrorKind::Internal,
    ];

    /// Whether a failure of this kind may be transient and worth an automatic retry.
    ///
    /// Only a push has a plausible transient-network cause.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::PushFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::SourceUnavailable => "SourceUnavailable",
            ErrorKind::RevisionNotFound => "RevisionNotFound",
            ErrorKind::BuildFailed => "BuildFailed",
            ErrorKind::PushFailed => "PushFailed",
            ErrorKind::RolloutTimeout => "RolloutTimeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Parse the stored name of a kind
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
