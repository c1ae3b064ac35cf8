//! Run Scheduler
//!
//! Admits run requests, bounds how many runs execute at once, and hands
//! admitted runs to the pipeline engine in FIFO order.
//!
//! Admission is two-phase: `submit` persists a `Pending` run and queues it;
//! `dispatch` starts queued runs while a permit from the concurrency
//! semaphore is available. A finished run returns its permit and dispatches
//! again, so the queue drains without a polling loop.

use sluice_core::domain::run::{ImageRef, Run, RunStatus, RunTrigger, SourceRef};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::engine::PipelineEngine;
use crate::repository::{RegistryError, RunRegistry};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("run {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: RunStatus },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Everything needed to admit a run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: SourceRef,
    pub image: ImageRef,
    pub trigger: RunTrigger,
}

/// What `cancel` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run was still queued and is now `Cancelled`
    Dequeued,
    /// The run is executing; it stops at its next checkpoint
    Signalled,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<Uuid>,
    running: HashMap<Uuid, CancellationToken>,
}

struct Inner {
    registry: Arc<dyn RunRegistry>,
    engine: Arc<PipelineEngine>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    state: Mutex<SchedulerState>,
}

/// Cheap to clone; clones share one queue and one concurrency bound
#[derive(Clone)]
pub struct RunScheduler {
    inner: Arc<Inner>,
}

impl RunScheduler {
    pub fn new(
        registry: Arc<dyn RunRegistry>,
        engine: Arc<PipelineEngine>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                engine,
                permits: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Admission bound
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Creates a `Pending` run and queues it for execution
    pub async fn submit(&self, request: RunRequest) -> Result<Uuid, SchedulerError> {
        let run = Run::new(request.source, request.image, request.trigger);
        self.inner.registry.create(&run).await?;

        info!(
            "Run {} admitted: {} at {}",
            run.id, run.source.repository, run.source.revision
        );

        self.enqueue(run.id).await;
        Ok(run.id)
    }

    /// Queues runs that already exist as `Pending`, in the given order
    pub async fn enqueue_existing(&self, ids: impl IntoIterator<Item = Uuid>) {
        {
            let mut state = self.inner.state.lock().await;
            state.queue.extend(ids);
        }
        self.dispatch().await;
    }

    /// Cancels a queued or running run
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, SchedulerError> {
        {
            let mut state = self.inner.state.lock().await;

            if let Some(position) = state.queue.iter().position(|queued| *queued == id) {
                state.queue.remove(position);
                drop(state);

                self.inner
                    .registry
                    .finish(id, RunStatus::Cancelled, None)
                    .await?;
                info!("Run {} cancelled while queued", id);
                return Ok(CancelOutcome::Dequeued);
            }

            if let Some(token) = state.running.get(&id) {
                token.cancel();
                info!("Cancellation signalled to run {}", id);
                return Ok(CancelOutcome::Signalled);
            }
        }

        // Not tracked by this scheduler: finished, or never enqueued
        let run = self
            .inner
            .registry
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))?;

        if run.is_terminal() {
            return Err(SchedulerError::AlreadyTerminal {
                id,
                status: run.status,
            });
        }

        self.inner
            .registry
            .finish(id, RunStatus::Cancelled, None)
            .await?;
        info!("Untracked run {} cancelled", id);
        Ok(CancelOutcome::Dequeued)
    }

    /// Runs waiting for a permit
    pub async fn queued(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Runs currently handed to the engine
    pub async fn running(&self) -> usize {
        self.inner.state.lock().await.running.len()
    }

    async fn enqueue(&self, id: Uuid) {
        {
            let mut state = self.inner.state.lock().await;
            state.queue.push_back(id);
        }
        self.dispatch().await;
    }

    /// Starts queued runs while permits are available
    async fn dispatch(&self) {
        let mut state = self.inner.state.lock().await;

        while let Some(&id) = state.queue.front() {
            let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
                debug!(
                    "Admission bound of {} reached, {} run(s) queued",
                    self.inner.max_concurrent,
                    state.queue.len()
                );
                break;
            };

            state.queue.pop_front();
            let token = CancellationToken::new();
            state.running.insert(id, token.clone());
            self.spawn_run(id, token, permit);
        }
    }

    fn spawn_run(&self, id: Uuid, token: CancellationToken, permit: OwnedSemaphorePermit) {
        let scheduler = self.clone();

        tokio::spawn(async move {
            match scheduler.inner.engine.run(id, token).await {
                Ok(status) => debug!("Engine finished run {} as {}", id, status),
                Err(e) => error!("Engine failed to drive run {}: {}", id, e),
            }

            scheduler.inner.state.lock().await.running.remove(&id);
            drop(permit);
            scheduler.dispatch().await;
        });
    }
}
