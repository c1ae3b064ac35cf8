//! Deploy stage
//!
//! Points the target deployment at the pushed digest and polls its rollout
//! until every desired replica runs the new revision, or the timeout passes.
//! A timed-out rollout is reported, never rolled back: the platform keeps the
//! previous revision serving.

use async_trait::async_trait;
use serde_json::{Value, json};
use sluice_core::domain::error::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::command::ExternalCommand;
use super::{TaskContext, TaskError, TaskExecutor, TaskOutput};
use crate::workspace::Workspace;

/// Snapshot of a deployment's rollout progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloutStatus {
    pub desired: u32,
    pub updated: u32,
    pub ready: u32,
    pub available: u32,
    /// All replicas, old and new
    pub total: u32,
    /// The controller has observed the latest spec change
    pub observed_current: bool,
}

impl RolloutStatus {
    /// New revision fully available and no old replicas left
    pub fn is_complete(&self) -> bool {
        self.observed_current
            && self.updated == self.desired
            && self.ready == self.desired
            && self.available == self.desired
            && self.total <= self.updated
    }

    /// Reads the status out of a Kubernetes Deployment object
    pub fn from_deployment(deployment: &Value) -> Self {
        let count = |pointer: &str| {
            deployment
                .pointer(pointer)
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32
        };

        let generation = deployment.pointer("/metadata/generation").and_then(Value::as_u64);
        let observed = deployment
            .pointer("/status/observedGeneration")
            .and_then(Value::as_u64);

        Self {
            // An unset replica count defaults to one on the platform side
            desired: deployment
                .pointer("/spec/replicas")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32,
            updated: count("/status/updatedReplicas"),
            ready: count("/status/readyReplicas"),
            available: count("/status/availableReplicas"),
            total: count("/status/replicas"),
            observed_current: matches!((generation, observed), (Some(g), Some(o)) if o >= g),
        }
    }
}

/// A named workload whose image can be updated and whose rollout can be queried
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    /// Human-readable identity, for logs and results
    fn name(&self) -> String;

    async fn set_image(&self, image: &str) -> Result<(), TaskError>;

    async fn rollout_status(&self) -> Result<RolloutStatus, TaskError>;
}

/// `DeploymentTarget` for a Kubernetes Deployment driven through kubectl
#[derive(Debug, Clone)]
pub struct KubectlTarget {
    bin: String,
    namespace: String,
    deployment: String,
    container: String,
    timeout: Duration,
}

impl KubectlTarget {
    pub fn new(
        bin: impl Into<String>,
        namespace: impl Into<String>,
        deployment: impl Into<String>,
        container: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            bin: bin.into(),
            namespace: namespace.into(),
            deployment: deployment.into(),
            container: container.into(),
            timeout,
        }
    }

    fn kubectl(&self) -> ExternalCommand {
        ExternalCommand::new(&self.bin)
            .args(["--namespace", self.namespace.as_str()])
            .timeout(self.timeout)
    }
}

#[async_trait]
impl DeploymentTarget for KubectlTarget {
    fn name(&self) -> String {
        format!("{}/{}", self.namespace, self.deployment)
    }

    async fn set_image(&self, image: &str) -> Result<(), TaskError> {
        let output = self
            .kubectl()
            .args(["set", "image"])
            .arg(format!("deployment/{}", self.deployment))
            .arg(format!("{}={}", self.container, image))
            .run()
            .await
            .map_err(|e| TaskError::internal(e.to_string()))?;

        if !output.success() {
            return Err(TaskError::internal(format!(
                "failed to update deployment {}: {}",
                self.name(),
                output.stderr_tail(3)
            )));
        }
        Ok(())
    }

    async fn rollout_status(&self) -> Result<RolloutStatus, TaskError> {
        let output = self
            .kubectl()
            .args(["get", "deployment", self.deployment.as_str(), "--output", "json"])
            .run()
            .await
            .map_err(|e| TaskError::internal(e.to_string()))?;

        if !output.success() {
            return Err(TaskError::internal(format!(
                "failed to read deployment {}: {}",
                self.name(),
                output.stderr_tail(3)
            )));
        }

        let deployment: Value = serde_json::from_str(&output.stdout)
            .map_err(|e| TaskError::internal(format!("unreadable deployment status: {}", e)))?;
        Ok(RolloutStatus::from_deployment(&deployment))
    }
}

/// The deploy stage
pub struct DeployTask {
    target: Arc<dyn DeploymentTarget>,
    timeout: Duration,
    poll_interval: Duration,
}

impl DeployTask {
    pub fn new(target: Arc<dyn DeploymentTarget>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            target,
            timeout,
            poll_interval,
        }
    }
}

#[async_trait]
impl TaskExecutor for DeployTask {
    async fn execute(
        &self,
        _workspace: &Workspace,
        ctx: &mut TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        ctx.checkpoint()?;

        let digest = ctx
            .image_digest
            .as_deref()
            .ok_or_else(|| TaskError::internal("deploy started without a pushed digest"))?;
        let image = ctx.image.pinned(digest);
        let target = self.target.name();

        info!("Deploying {} to {} for run {}", image, target, ctx.run_id);
        self.target.set_image(&image).await?;

        let deadline = Instant::now() + self.timeout;
        let mut polls = 0u32;
        let mut last = RolloutStatus::default();

        loop {
            ctx.checkpoint()?;

            polls += 1;
            // A query that never answers must not outlive the rollout deadline
            let remaining = deadline.saturating_duration_since(Instant::now());
            let query = tokio::select! {
                result = tokio::time::timeout(remaining, self.target.rollout_status()) => result,
                _ = ctx.cancel.cancelled() => return Err(TaskError::cancelled()),
            };

            match query {
                Ok(Ok(status)) if status.is_complete() => {
                    info!(
                        "Rollout of {} complete: {}/{} replicas ready",
                        target, status.ready, status.desired
                    );
                    return Ok(TaskOutput::new(json!({
                        "deployment": target,
                        "image": image,
                        "replicas": status.desired,
                        "polls": polls,
                    })));
                }
                Ok(Ok(status)) => {
                    debug!(
                        "Rollout of {} in progress: updated={} ready={} available={} desired={}",
                        target, status.updated, status.ready, status.available, status.desired
                    );
                    last = status;
                }
                // Readiness queries are retried until the deadline
                Ok(Err(e)) => warn!("Rollout status query for {} failed: {}", target, e.detail),
                Err(_) => warn!(
                    "Rollout status query for {} did not answer within {:?}",
                    target, remaining
                ),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TaskError::new(
                    ErrorKind::RolloutTimeout,
                    format!(
                        "{} not ready after {:?} ({}/{} replicas ready); previous revision left serving",
                        target, self.timeout, last.ready, last.desired
                    ),
                ));
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = ctx.cancel.cancelled() => return Err(TaskError::cancelled()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{FakeTarget, sample_run};
    use crate::workspace::WorkspaceManager;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn context_with_digest(token: CancellationToken) -> TaskContext {
        let mut ctx = TaskContext::for_run(&sample_run(), token);
        ctx.resolved_commit = Some("abc123".to_string());
        ctx.image_digest = Some("sha256:deadbeef".to_string());
        ctx
    }

    #[test]
    fn test_status_from_deployment() {
        let deployment = json!({
            "metadata": {"generation": 4},
            "spec": {"replicas": 3},
            "status": {
                "observedGeneration": 4,
                "replicas": 3,
                "updatedReplicas": 3,
                "readyReplicas": 3,
                "availableReplicas": 3
            }
        });
        let status = RolloutStatus::from_deployment(&deployment);
        assert_eq!(status.desired, 3);
        assert!(status.observed_current);
        assert!(status.is_complete());
    }

    #[test]
    fn test_status_incomplete_cases() {
        // Spec change not yet observed by the controller
        let stale = json!({
            "metadata": {"generation": 5},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 4, "replicas": 2, "updatedReplicas": 2,
                       "readyReplicas": 2, "availableReplicas": 2}
        });
        assert!(!RolloutStatus::from_deployment(&stale).is_complete());

        // Old replica still around
        let surging = json!({
            "metadata": {"generation": 5},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 5, "replicas": 3, "updatedReplicas": 2,
                       "readyReplicas": 2, "availableReplicas": 2}
        });
        assert!(!RolloutStatus::from_deployment(&surging).is_complete());

        // Fresh deployment with no status yet
        let empty = json!({"metadata": {"generation": 1}, "spec": {}});
        let status = RolloutStatus::from_deployment(&empty);
        assert_eq!(status.desired, 1);
        assert!(!status.is_complete());
    }

    #[tokio::test]
    async fn test_deploy_sets_pinned_image_and_waits_for_readiness() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();

        let target = Arc::new(FakeTarget::ready_after(2));
        let task = DeployTask::new(
            target.clone(),
            Duration::from_secs(5),
            Duration::from_millis(5),
        );
        let mut ctx = context_with_digest(CancellationToken::new());

        let output = task.execute(&workspace, &mut ctx).await.unwrap();
        assert_eq!(
            target.images(),
            vec!["registry.example.com/team/app@sha256:deadbeef".to_string()]
        );
        assert_eq!(output.result["polls"], 3);
        assert_eq!(target.polls(), 3);
    }

    #[tokio::test]
    async fn test_rollout_timeout() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();

        let target = Arc::new(FakeTarget::never_ready());
        let task = DeployTask::new(
            target.clone(),
            Duration::from_millis(60),
            Duration::from_millis(10),
        );
        let mut ctx = context_with_digest(CancellationToken::new());

        let err = task.execute(&workspace, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RolloutTimeout);
        assert!(target.polls() >= 2);
        // Only the forward update was issued; no rollback
        assert_eq!(target.images().len(), 1);
    }

    #[tokio::test]
    async fn test_hung_status_query_times_out() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();

        let target = Arc::new(FakeTarget::hanging());
        let task = DeployTask::new(
            target.clone(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        let mut ctx = context_with_digest(CancellationToken::new());

        let err = tokio::time::timeout(Duration::from_secs(5), task.execute(&workspace, &mut ctx))
            .await
            .expect("deploy should give up at its own deadline")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RolloutTimeout);
        assert_eq!(target.polls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_hung_status_query() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();

        let task = DeployTask::new(
            Arc::new(FakeTarget::hanging()),
            Duration::from_secs(30),
            Duration::from_millis(10),
        );
        let token = CancellationToken::new();
        let mut ctx = context_with_digest(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), task.execute(&workspace, &mut ctx))
            .await
            .expect("cancellation should interrupt the query")
            .unwrap_err();
        canceller.await.unwrap();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_while_polling_stops_polling() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();

        let target = Arc::new(FakeTarget::never_ready());
        let task = DeployTask::new(
            target.clone(),
            Duration::from_secs(30),
            Duration::from_millis(20),
        );
        let token = CancellationToken::new();
        let mut ctx = context_with_digest(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(70)).await;
            token.cancel();
        });

        let err = task.execute(&workspace, &mut ctx).await.unwrap_err();
        canceller.await.unwrap();
        assert_eq!(err.kind, ErrorKind::Cancelled);

        let polls = target.polls();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(target.polls(), polls);
    }

    #[tokio::test]
    async fn test_deploy_requires_digest() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path(), 1);
        let workspace = manager.acquire(Uuid::new_v4()).await.unwrap();

        let target = Arc::new(FakeTarget::ready_after(0));
        let task = DeployTask::new(target.clone(), Duration::from_secs(1), Duration::from_millis(5));
        let mut ctx = TaskContext::for_run(&sample_run(), CancellationToken::new());

        let err = task.execute(&workspace, &mut ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(target.images().is_empty());
    }
}
