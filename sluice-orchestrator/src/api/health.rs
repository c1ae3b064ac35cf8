//! Health Check API Handler
//!
//! Liveness plus a view of the scheduler's load.

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::api::AppState;

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "running": state.scheduler.running().await,
        "queued": state.scheduler.queued().await,
        "max_concurrent_runs": state.scheduler.max_concurrent(),
    }))
}
