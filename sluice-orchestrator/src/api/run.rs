//! Run API Handlers
//!
//! Query surface and manual administration of runs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use sluice_core::domain::run::{ImageRef, Run, RunStatus, RunTrigger, SourceRef};
use sluice_core::dto::run::{RunSummary, TriggerRun};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::RunRequest;

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
}

/// POST /run/trigger
/// Admit a run for an explicit revision, bypassing the webhook
pub async fn trigger_run(
    State(state): State<AppState>,
    Json(req): Json<TriggerRun>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let revision = req.revision.trim();
    if revision.is_empty() {
        return Err(ApiError::BadRequest("revision cannot be empty".to_string()));
    }
    if revision.starts_with('-') {
        return Err(ApiError::BadRequest(format!(
            "revision '{}' cannot start with '-'",
            revision
        )));
    }

    let repository = req
        .repository
        .filter(|r| !r.trim().is_empty())
        .or_else(|| state.source_repository.clone())
        .ok_or_else(|| {
            ApiError::BadRequest("repository is required; no default is configured".to_string())
        })?;
    if repository.trim_start().starts_with('-') {
        return Err(ApiError::BadRequest(format!(
            "repository '{}' cannot start with '-'",
            repository
        )));
    }

    let tag = req.tag.filter(|t| !t.trim().is_empty());
    if let Some(tag) = &tag {
        if tag == "latest" || tag.contains(char::is_whitespace) || tag.contains(':') {
            return Err(ApiError::BadRequest(format!(
                "'{}' is not an immutable image tag",
                tag
            )));
        }
    }

    tracing::info!("Manual trigger for {} at {}", repository, revision);

    let id = state
        .scheduler
        .submit(RunRequest {
            source: SourceRef {
                repository,
                revision: revision.to_string(),
            },
            image: ImageRef {
                repository: state.image_repository.clone(),
                tag,
            },
            trigger: RunTrigger::Manual,
        })
        .await?;

    let run = state
        .registry
        .get(id)
        .await?
        .ok_or(ApiError::NotFound(format!("Run {} not found", id)))?;

    Ok((StatusCode::CREATED, Json(run)))
}

/// GET /run/list
/// List runs newest first, optionally filtered by `?status=`
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            RunStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status '{}'", s)))?,
        ),
        None => None,
    };

    tracing::debug!("Listing runs (status: {:?})", status);

    let runs = state.registry.list(status).await?;
    Ok(Json(runs.iter().map(RunSummary::from).collect()))
}

/// GET /run/{id}
/// Get a run with its TaskRuns
pub async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Run>> {
    tracing::debug!("Getting run: {}", id);

    let run = state
        .registry
        .get(id)
        .await?
        .ok_or(ApiError::NotFound(format!("Run {} not found", id)))?;

    Ok(Json(run))
}

/// POST /run/{id}/cancel
/// Cancel a queued or running run
///
/// A running run stops at its next checkpoint, so the returned snapshot
/// may still read `Running`.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let outcome = state.scheduler.cancel(id).await?;
    tracing::info!("Cancel of run {}: {:?}", id, outcome);

    let run = state
        .registry
        .get(id)
        .await?
        .ok_or(ApiError::NotFound(format!("Run {} not found", id)))?;

    let status = if run.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(run)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing;
    use crate::executor::testing::{ScriptedStages, Step};
    use sluice_core::domain::error::ErrorKind;
    use sluice_core::domain::task::TaskKind;
    use std::time::Duration;

    fn trigger(revision: &str, tag: Option<&str>) -> TriggerRun {
        TriggerRun {
            repository: None,
            revision: revision.to_string(),
            tag: tag.map(str::to_string),
        }
    }

    async fn wait_terminal(state: &AppState, id: Uuid) -> Run {
        for _ in 0..500 {
            let run = state.registry.get(id).await.unwrap().unwrap();
            if run.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {} did not finish", id);
    }

    #[tokio::test]
    async fn test_manual_trigger_runs_to_success() {
        let root = tempfile::tempdir().unwrap();
        let state = testing::state(&ScriptedStages::succeeding(), root.path());

        let (status, Json(run)) =
            trigger_run(State(state.clone()), Json(trigger("main", Some("v1.4.0"))))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(run.trigger, RunTrigger::Manual);
        assert_eq!(run.image.tag.as_deref(), Some("v1.4.0"));
        assert_eq!(run.source.repository, "https://git.example.com/team/app.git");

        let finished = wait_terminal(&state, run.id).await;
        assert_eq!(finished.status, RunStatus::Succeeded);

        let Json(fetched) = get_run(State(state), Path(run.id)).await.unwrap();
        assert_eq!(fetched.tasks.len(), 3);
    }

    #[tokio::test]
    async fn test_trigger_validation() {
        let root = tempfile::tempdir().unwrap();
        let mut state = testing::state(&ScriptedStages::succeeding(), root.path());

        let err = trigger_run(State(state.clone()), Json(trigger("  ", None)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = trigger_run(State(state.clone()), Json(trigger("main", Some("latest"))))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = trigger_run(State(state.clone()), Json(trigger("--upload-pack=id", None)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let mut injected = trigger("main", None);
        injected.repository = Some("--upload-pack=touch /tmp/x;".to_string());
        let err = trigger_run(State(state.clone()), Json(injected))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(state.registry.list(None).await.unwrap().is_empty());

        state.source_repository = None;
        let err = trigger_run(State(state), Json(trigger("main", None)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_filters_and_rejects_unknown_status() {
        let root = tempfile::tempdir().unwrap();
        let scripted = ScriptedStages::succeeding()
            .with(TaskKind::BuildPush, Step::Fail(ErrorKind::BuildFailed));
        let state = testing::state(&scripted, root.path());

        let (_, Json(run)) = trigger_run(State(state.clone()), Json(trigger("main", None)))
            .await
            .unwrap();
        wait_terminal(&state, run.id).await;

        let Json(failed) = list_runs(
            State(state.clone()),
            Query(ListRunsQuery {
                status: Some("failed".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failed_task, Some(TaskKind::BuildPush));

        let Json(succeeded) = list_runs(
            State(state.clone()),
            Query(ListRunsQuery {
                status: Some("Succeeded".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(succeeded.is_empty());

        let err = list_runs(
            State(state),
            Query(ListRunsQuery {
                status: Some("done".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_unknown_run() {
        let root = tempfile::tempdir().unwrap();
        let state = testing::state(&ScriptedStages::succeeding(), root.path());

        let err = get_run(State(state), Path(Uuid::new_v4())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_running_then_terminal_conflict() {
        let root = tempfile::tempdir().unwrap();
        let scripted = ScriptedStages::succeeding().with(TaskKind::Deploy, Step::WaitForCancel);
        let journal = scripted.journal();
        let state = testing::state(&scripted, root.path());

        let (_, Json(run)) = trigger_run(State(state.clone()), Json(trigger("main", None)))
            .await
            .unwrap();
        for _ in 0..500 {
            if journal.stages_of(run.id).contains(&TaskKind::Deploy) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (status, _) = cancel_run(State(state.clone()), Path(run.id)).await.unwrap();
        assert!(status == StatusCode::ACCEPTED || status == StatusCode::OK);

        let finished = wait_terminal(&state, run.id).await;
        assert_eq!(finished.status, RunStatus::Cancelled);

        // Wait for the scheduler to forget the run before cancelling again
        for _ in 0..500 {
            if state.scheduler.running().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let err = cancel_run(State(state), Path(run.id)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }
}
