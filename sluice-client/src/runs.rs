//! Run-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sluice_core::domain::run::{Run, RunStatus};
use sluice_core::dto::run::{RunSummary, TriggerRun};
use uuid::Uuid;

/// Orchestrator liveness and load, as reported by `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub running: usize,
    pub queued: usize,
    pub max_concurrent_runs: usize,
}

impl OrchestratorClient {
    /// Trigger a run for an explicit revision
    ///
    /// # Arguments
    /// * `req` - Repository (optional), revision and image tag (optional)
    ///
    /// # Returns
    /// The admitted run, still `Pending`
    pub async fn trigger_run(&self, req: TriggerRun) -> Result<Run> {
        let url = format!("{}/run/trigger", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// List runs, newest first
    ///
    /// # Arguments
    /// * `status` - Only return runs in this status
    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunSummary>> {
        let url = format!("{}/run/list", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(status) = status {
            request = request.query(&[("status", status.as_str())]);
        }
        let response = request.send().await?;

        self.handle_response(response).await
    }

    /// Get a run with its TaskRuns
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let url = format!("{}/run/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a run
    ///
    /// A running run stops at its next checkpoint, so the returned snapshot
    /// may still be `Running`.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        let url = format!("{}/run/{}/cancel", self.base_url, run_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Check orchestrator health
    pub async fn health(&self) -> Result<HealthReport> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }
}
