//! In-memory run registry
//!
//! Used when no database is configured, and by tests.

use async_trait::async_trait;
use sluice_core::domain::run::{Run, RunFailure, RunStatus};
use sluice_core::domain::task::TaskRun;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    RegistryError, RunRegistry, apply_artifacts, apply_finish, apply_mark_running,
    apply_record_task,
};

/// Registry that keeps every run in a process-local map
#[derive(Default)]
pub struct MemoryRunRegistry {
    runs: RwLock<HashMap<Uuid, Run>>,
}

impl MemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, id: Uuid, f: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Run) -> Result<(), RegistryError>,
    {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(RegistryError::NotFound(id))?;

        // Apply to a copy so a rejected transition leaves the stored run untouched
        let mut updated = run.clone();
        f(&mut updated)?;
        *run = updated;
        Ok(())
    }
}

#[async_trait]
impl RunRegistry for MemoryRunRegistry {
    async fn create(&self, run: &Run) -> Result<(), RegistryError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(RegistryError::InvalidState(format!(
                "run {} already exists",
                run.id
            )));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>, RegistryError> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list(&self, status: Option<RunStatus>) -> Result<Vec<Run>, RegistryError> {
        let runs = self.runs.read().await;
        let mut matching: Vec<Run> = runs
            .values()
            .filter(|run| status.is_none_or(|s| run.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), RegistryError> {
        self.update(id, apply_mark_running).await
    }

    async fn record_task(&self, id: Uuid, task: &TaskRun) -> Result<(), RegistryError> {
        self.update(id, |run| apply_record_task(run, task).map(|_| ()))
            .await
    }

    async fn record_artifacts(
        &self,
        id: Uuid,
        resolved_commit: Option<&str>,
        image_digest: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.update(id, |run| apply_artifacts(run, resolved_commit, image_digest))
            .await
    }

    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        failure: Option<RunFailure>,
    ) -> Result<(), RegistryError> {
        self.update(id, |run| apply_finish(run, status, failure))
            .await
    }
}
