//! Test doubles for executors and the capabilities behind them

use async_trait::async_trait;
use serde_json::json;
use sluice_core::domain::error::ErrorKind;
use sluice_core::domain::run::{ImageRef, Run, RunTrigger, SourceRef};
use sluice_core::domain::task::TaskKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::{
    DeploymentTarget, ImageBuilder, RegistryCredential, RolloutStatus, SourceFetcher, Stages,
    TaskContext, TaskError, TaskExecutor, TaskOutput,
};
use crate::workspace::Workspace;

pub const COMMIT: &str = "abc123";
pub const DIGEST: &str = "sha256:deadbeef";

pub fn sample_source() -> SourceRef {
    SourceRef {
        repository: "https://git.example.com/team/app.git".to_string(),
        revision: "main".to_string(),
    }
}

pub fn sample_image() -> ImageRef {
    ImageRef {
        repository: "registry.example.com/team/app".to_string(),
        tag: None,
    }
}

pub fn sample_run() -> Run {
    Run::new(sample_source(), sample_image(), RunTrigger::Manual)
}

// =============================================================================
// Scripted stages
// =============================================================================

/// What a scripted executor does when it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    Fail(ErrorKind),
    /// Blocks until the run is cancelled
    WaitForCancel,
    /// Blocks until the test releases a gate permit
    Gate,
}

/// Observations shared by all scripted executors of one `ScriptedStages`
#[derive(Default)]
pub struct Journal {
    executed: Mutex<Vec<(Uuid, TaskKind)>>,
    workspaces: Mutex<Vec<PathBuf>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Journal {
    fn enter(&self, run_id: Uuid, kind: TaskKind, workspace: &Path) {
        self.executed.lock().unwrap().push((run_id, kind));
        self.workspaces.lock().unwrap().push(workspace.to_path_buf());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Stages executed for `run_id`, in order
    pub fn stages_of(&self, run_id: Uuid) -> Vec<TaskKind> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, kind)| *kind)
            .collect()
    }

    pub fn executed_count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn workspaces(&self) -> Vec<PathBuf> {
        self.workspaces.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct ScriptedExecutor {
    kind: TaskKind,
    step: Step,
    journal: Arc<Journal>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        workspace: &Workspace,
        ctx: &mut TaskContext,
    ) -> Result<TaskOutput, TaskError> {
        ctx.checkpoint()?;

        self.journal.enter(ctx.run_id, self.kind, workspace.path());
        let outcome = match self.step {
            Step::Succeed => Ok(()),
            Step::Fail(kind) => Err(TaskError::new(kind, format!("scripted {} failure", self.kind))),
            Step::WaitForCancel => {
                ctx.cancel.cancelled().await;
                Err(TaskError::cancelled())
            }
            Step::Gate => {
                tokio::select! {
                    permit = self.gate.acquire() => permit
                        .map(|p| p.forget())
                        .map_err(|_| TaskError::internal("gate closed")),
                    _ = ctx.cancel.cancelled() => Err(TaskError::cancelled()),
                }
            }
        };
        self.journal.exit();
        outcome?;

        match self.kind {
            TaskKind::Clone => ctx.resolved_commit = Some(COMMIT.to_string()),
            TaskKind::BuildPush => ctx.image_digest = Some(DIGEST.to_string()),
            TaskKind::Deploy => {}
        }

        Ok(TaskOutput::new(json!({ "stage": self.kind.as_str() })))
    }
}

/// Builder for a `Stages` made of scripted executors
pub struct ScriptedStages {
    steps: [Step; 3],
    journal: Arc<Journal>,
    gate: Arc<Semaphore>,
}

impl ScriptedStages {
    pub fn succeeding() -> Self {
        Self {
            steps: [Step::Succeed; 3],
            journal: Arc::new(Journal::default()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn with(mut self, kind: TaskKind, step: Step) -> Self {
        self.steps[kind.position()] = step;
        self
    }

    pub fn journal(&self) -> Arc<Journal> {
        self.journal.clone()
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone()
    }

    pub fn stages(&self) -> Stages {
        let executor = |kind: TaskKind| -> Arc<dyn TaskExecutor> {
            Arc::new(ScriptedExecutor {
                kind,
                step: self.steps[kind.position()],
                journal: self.journal.clone(),
                gate: self.gate.clone(),
            })
        };
        Stages::new(
            executor(TaskKind::Clone),
            executor(TaskKind::BuildPush),
            executor(TaskKind::Deploy),
        )
    }
}

// =============================================================================
// Capability fakes
// =============================================================================

pub struct FakeFetcher {
    result: Result<String, ErrorKind>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn resolving(commit: &str) -> Self {
        Self {
            result: Ok(commit.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(kind: ErrorKind) -> Self {
        Self {
            result: Err(kind),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, _source: &SourceRef, dest: &Path) -> Result<String, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Ok(commit) => {
                std::fs::create_dir_all(dest).unwrap();
                std::fs::write(dest.join("Containerfile"), "FROM scratch\n").unwrap();
                Ok(commit.clone())
            }
            Err(kind) => Err(TaskError::new(*kind, "fake fetch failure")),
        }
    }
}

pub struct FakeBuilder {
    digest: String,
    fail_build: bool,
    failing_pushes: usize,
    builds: AtomicUsize,
    pushes: AtomicUsize,
    built: Mutex<Vec<String>>,
}

impl FakeBuilder {
    pub fn new(digest: &str) -> Self {
        Self {
            digest: digest.to_string(),
            fail_build: false,
            failing_pushes: 0,
            builds: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    /// The first `n` pushes fail with `PushFailed`
    pub fn failing_pushes(mut self, n: usize) -> Self {
        self.failing_pushes = n;
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn built_images(&self) -> Vec<String> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, _context: &Path, _descriptor: &Path, image: &str) -> Result<(), TaskError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.built.lock().unwrap().push(image.to_string());
        if self.fail_build {
            return Err(TaskError::new(ErrorKind::BuildFailed, "step 2/3 exited with 1"));
        }
        Ok(())
    }

    async fn push(
        &self,
        _image: &str,
        _credential: Option<&RegistryCredential>,
        _scratch: &Path,
    ) -> Result<String, TaskError> {
        let attempt = self.pushes.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failing_pushes {
            return Err(TaskError::new(ErrorKind::PushFailed, "connection reset by peer"));
        }
        Ok(self.digest.clone())
    }
}

pub struct FakeTarget {
    ready_after: Option<usize>,
    hang: bool,
    polls: AtomicUsize,
    images: Mutex<Vec<String>>,
}

impl FakeTarget {
    /// Reports readiness on poll `n + 1`
    pub fn ready_after(n: usize) -> Self {
        Self {
            ready_after: Some(n),
            hang: false,
            polls: AtomicUsize::new(0),
            images: Mutex::new(Vec::new()),
        }
    }

    pub fn never_ready() -> Self {
        Self {
            ready_after: None,
            hang: false,
            polls: AtomicUsize::new(0),
            images: Mutex::new(Vec::new()),
        }
    }

    /// Status queries never return
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::never_ready()
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn images(&self) -> Vec<String> {
        self.images.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeploymentTarget for FakeTarget {
    fn name(&self) -> String {
        "apps/web".to_string()
    }

    async fn set_image(&self, image: &str) -> Result<(), TaskError> {
        self.images.lock().unwrap().push(image.to_string());
        Ok(())
    }

    async fn rollout_status(&self) -> Result<RolloutStatus, TaskError> {
        let previous = self.polls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        let ready = self.ready_after.is_some_and(|n| previous >= n);
        Ok(RolloutStatus {
            desired: 2,
            updated: if ready { 2 } else { 1 },
            ready: if ready { 2 } else { 1 },
            available: if ready { 2 } else { 1 },
            total: if ready { 2 } else { 3 },
            observed_current: true,
        })
    }
}
