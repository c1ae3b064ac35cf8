//! Clone stage
//!
//! Fetches the source tree at the requested revision into the workspace and
//! pins the run to the exact commit the revision resolved to.

use async_trait::async_trait;
use serde_json::json;
use sluice_core::domain::error::ErrorKind;
use sluice_core::domain::run::SourceRef;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::command::{CommandError, ExternalCommand};
use super::{TaskContext, TaskError, TaskExecutor, TaskOutput};
use crate::workspace::Workspace;

/// Retrieves source trees
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetches `source` into `dest` and returns the resolved commit id
    async fn fetch(&self, source: &SourceRef, dest: &Path) -> Result<String, TaskError>;
}

/// `SourceFetcher` backed by the git CLI
///
/// Uses a shallow fetch of exactly the requested revision, so branch names,
/// tags and full commit ids all resolve the same way.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git_bin: String,
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(git_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            git_bin: git_bin.into(),
            timeout,
        }
    }

    fn git(&self, dest: &Path) -> ExternalCommand {
        ExternalCommand::new(&self.git_bin)
            .arg("-C")
            .arg(dest.to_string_lossy())
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(self.timeout)
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, source: &SourceRef, dest: &Path) -> Result<String, TaskError> {
        reject_option_like(source)?;

        tokio::fs::create_dir_all(dest).await.map_err(|e| {
            TaskError::internal(format!("failed to create {}: {}", dest.display(), e))
        })?;

        let init = self
            .git(dest)
            .args(["init", "--quiet"])
            .run()
            .await
            .map_err(unavailable)?;
        if !init.success() {
            return Err(TaskError::internal(format!(
                "git init failed: {}",
                init.stderr_tail(3)
            )));
        }

        let fetch = self
            .git(dest)
            .args(["fetch", "--quiet", "--depth", "1", "--"])
            .arg(&source.repository)
            .arg(&source.revision)
            .run()
            .await
            .map_err(unavailable)?;
        if !fetch.success() {
            let stderr = fetch.stderr_tail(5);
            return Err(TaskError::new(classify_fetch_error(&stderr), stderr));
        }

        let checkout = self
            .git(dest)
            .args(["checkout", "--quiet", "--detach", "FETCH_HEAD"])
            .run()
            .await
            .map_err(unavailable)?;
        if !checkout.success() {
            return Err(TaskError::internal(format!(
                "git checkout failed: {}",
                checkout.stderr_tail(3)
            )));
        }

        let rev_parse = self
            .git(dest)
            .args(["rev-parse", "HEAD"])
            .run()
            .await
            .map_err(unavailable)?;
        let commit = rev_parse.stdout.trim().to_string();
        if !rev_parse.success() || commit.is_empty() {
            return Err(TaskError::internal(format!(
                "git rev-parse failed: {}",
                rev_parse.stderr_tail(3)
            )));
        }

        Ok(commit)
    }
}

/// A repository or revision starting with `-` would be parsed by git as an
/// option (`--upload-pack=...` runs a command)
fn reject_option_like(source: &SourceRef) -> Result<(), TaskError> {
    if source.repository.starts_with('-') {
        return Err(TaskError::new(
            ErrorKind::SourceUnavailable,
            format!("refusing repository '{}'", source.repository),
        ));
    }
    if source.revision.starts_with('-') {
        return Err(TaskError::new(
            ErrorKind::RevisionNotFound,
            format!("refusing revision '{}'", source.revision),
        ));
    }
    Ok(())
}

/// Spawn failures and timeouts mean the source could not be reached
fn unavailable(err: CommandError) -> TaskError {
    TaskError::new(ErrorKind::SourceUnavailable, err.to_string())
}

/// Distinguishes a missing revision from network and auth failures
pub fn classify_fetch_error(stderr: &str) -> ErrorKind {
    let lower = stderr.to_lowercase();
    let missing = [
        "couldn't find remote ref",
        "not our ref",
        "unknown revision",
        "invalid refspec",
    ];
    if missing.iter().any(|marker| lower.contains(marker)) {
        ErrorKind::RevisionNotFound
    } else {
        ErrorKind::SourceUnavailable
    }
}

/// The clone stage
pub struct CloneTask {
    fetcher: Arc<dyn SourceFetcher>,
}

impl CloneTask {
    pub fn new(fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl TaskExecutor for CloneTask {
    async fn execute(
        &self,
        workspace: &Workspace,
        ctx: &mut TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        ctx.checkpoint()?;

        info!(
            "Cloning {} at {} for run {}",
            ctx.source.repository, ctx.source.revision, ctx.run_id
        );

        let commit = self
            .fetcher
            .fetch(&ctx.source, &workspace.source_dir())
            .await?;

        info!(
            "Run {} pinned to commit {} ({})",
            ctx.run_id, commit, ctx.source.revision
        );

        ctx.resolved_commit = Some(commit.clone());

        Ok(TaskOutput::new(json!({
            "commit": commit,
            "revision": ctx.source.revision,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{FakeFetcher, sample_run};
    use crate::workspace::WorkspaceManager;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    #[test]
    fn test_classify_fetch_error() {
        assert_eq!(
            classify_fetch_error("fatal: couldn't find remote ref refs/heads/nope"),
            ErrorKind::RevisionNotFound
        );
        assert_eq!(
            classify_fetch_error("error: Server does not allow request for unadvertised object abc: not our ref"),
            ErrorKind::RevisionNotFound
        );
        assert_eq!(
            classify_fetch_error("fatal: could not read Username for 'https://git.example.com'"),
            ErrorKind::SourceUnavailable
        );
        assert_eq!(
            classify_fetch_error("fatal: unable to access: Could not resolve host"),
            ErrorKind::SourceUnavailable
        );
    }

    #[tokio::test]
    async fn test_clone_records_resolved_commit() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();

        let fetcher = Arc::new(FakeFetcher::resolving("abc123"));
        let task = CloneTask::new(fetcher.clone());
        let mut ctx = TaskContext::for_run(&sample_run(), CancellationToken::new());

        let output = task.execute(&workspace, &mut ctx).await.unwrap();
        assert_eq!(ctx.resolved_commit.as_deref(), Some("abc123"));
        assert_eq!(output.result["commit"], "abc123");
        assert_eq!(output.result["revision"], "main");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_clone_propagates_fetch_error() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();

        let task = CloneTask::new(Arc::new(FakeFetcher::failing(ErrorKind::RevisionNotFound)));
        let mut ctx = TaskContext::for_run(&sample_run(), CancellationToken::new());

        let err = task.execute(&workspace, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RevisionNotFound);
        assert!(ctx.resolved_commit.is_none());
    }

    #[tokio::test]
    async fn test_clone_checks_cancellation_on_entry() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();

        let fetcher = Arc::new(FakeFetcher::resolving("abc123"));
        let task = CloneTask::new(fetcher.clone());
        let token = CancellationToken::new();
        token.cancel();
        let mut ctx = TaskContext::for_run(&sample_run(), token);

        let err = task.execute(&workspace, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_git_fetch_refuses_option_like_arguments() {
        let scratch = tempfile::tempdir().unwrap();
        let marker = scratch.path().join("upload-pack-ran");
        let fetcher = GitFetcher::new("git", Duration::from_secs(30));

        let injected = SourceRef {
            repository: format!("--upload-pack=touch {};", marker.display()),
            revision: scratch.path().to_string_lossy().to_string(),
        };
        let err = fetcher
            .fetch(&injected, &scratch.path().join("src"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SourceUnavailable);
        assert!(!marker.exists());

        let dashed_revision = SourceRef {
            repository: "https://git.example.com/team/app.git".to_string(),
            revision: "--upload-pack=true".to_string(),
        };
        let err = fetcher
            .fetch(&dashed_revision, &scratch.path().join("other"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RevisionNotFound);
        assert!(!scratch.path().join("other").exists());
    }

    #[tokio::test]
    async fn test_git_fetch_from_local_repository() {
        // Skipped where git is not installed
        if std::process::Command::new("git").arg("--version").output().is_err() {
            return;
        }

        let origin = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            std::process::Command::new("git")
                .arg("-C")
                .arg(origin.path())
                .args(args)
                .env("GIT_AUTHOR_NAME", "sluice")
                .env("GIT_AUTHOR_EMAIL", "sluice@example.com")
                .env("GIT_COMMITTER_NAME", "sluice")
                .env("GIT_COMMITTER_EMAIL", "sluice@example.com")
                .output()
                .unwrap()
        };
        git(&["init", "--quiet", "--initial-branch=main"]);
        std::fs::write(origin.path().join("Containerfile"), "FROM scratch\n").unwrap();
        git(&["add", "Containerfile"]);
        git(&["commit", "--quiet", "-m", "initial"]);
        let head = String::from_utf8(git(&["rev-parse", "HEAD"]).stdout).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let fetcher = GitFetcher::new("git", Duration::from_secs(30));
        let source = SourceRef {
            repository: origin.path().to_string_lossy().to_string(),
            revision: "main".to_string(),
        };

        let commit = fetcher.fetch(&source, &dest.path().join("src")).await.unwrap();
        assert_eq!(commit, head.trim());
        assert!(dest.path().join("src/Containerfile").is_file());

        let missing = SourceRef {
            revision: "no-such-branch".to_string(),
            ..source
        };
        let err = fetcher
            .fetch(&missing, &dest.path().join("other"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RevisionNotFound);
    }
}
