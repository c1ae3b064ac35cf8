//! Service Module
//!
//! Control plane of the orchestrator: admission, sequencing and recovery.
//! Services orchestrate between the run registry, the workspace manager and
//! the task executors.

pub mod engine;
pub mod recovery;
pub mod scheduler;
pub mod webhook;

pub use engine::PipelineEngine;
pub use scheduler::{CancelOutcome, RunRequest, RunScheduler, SchedulerError};
pub use webhook::{Delivery, WebhookError, WebhookReceiver};
