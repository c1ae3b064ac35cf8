//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific surface.

pub mod error;
pub mod health;
pub mod run;
pub mod webhook;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::repository::RunRegistry;
use crate::service::{RunScheduler, WebhookReceiver};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn RunRegistry>,
    pub scheduler: RunScheduler,
    pub webhook: Arc<WebhookReceiver>,
    /// Repository manual triggers fall back to
    pub source_repository: Option<String>,
    pub image_repository: String,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Source-control webhook
        .route("/webhook", post(webhook::receive_webhook))
        // Run endpoints
        .route("/run/trigger", post(run::trigger_run))
        .route("/run/list", get(run::list_runs))
        .route("/run/{id}", get(run::get_run))
        .route("/run/{id}/cancel", post(run::cancel_run))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
