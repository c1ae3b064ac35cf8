//! Postgres run registry
//!
//! Handles all database operations related to runs and their TaskRuns.
//! Every write locks the run row (`SELECT ... FOR UPDATE`) inside a
//! transaction, which serializes writes per run without a global lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::domain::error::ErrorKind;
use sluice_core::domain::run::{ImageRef, Run, RunFailure, RunStatus, RunTrigger, SourceRef};
use sluice_core::domain::task::{TaskFailure, TaskKind, TaskRun};
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    RegistryError, RunRegistry, apply_artifacts, apply_finish, apply_mark_running,
    apply_record_task,
};

const RUN_COLUMNS: &str = r#"
    id, repository, revision, image_repository, image_tag, trigger_type, delivery_id,
    status, created_at, started_at, completed_at, resolved_commit, image_digest,
    failure_task, failure_kind, failure_detail
"#;

const TASK_COLUMNS: &str = r#"
    run_id, position, kind, status, started_at, completed_at, attempts, result,
    error_kind, error_detail
"#;

/// Registry backed by a Postgres pool
#[derive(Clone)]
pub struct PgRunRegistry {
    pool: PgPool,
}

impl PgRunRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load, transform and write back one run inside a locking transaction
    async fn mutate<F>(&self, id: Uuid, f: F) -> Result<Run, RegistryError>
    where
        F: FnOnce(&mut Run) -> Result<(), RegistryError> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let mut run = load_run(&mut tx, id, true)
            .await?
            .ok_or(RegistryError::NotFound(id))?;

        f(&mut run)?;
        write_run(&mut tx, &run).await?;

        tx.commit().await?;
        Ok(run)
    }
}

#[async_trait]
impl RunRegistry for PgRunRegistry {
    async fn create(&self, run: &Run) -> Result<(), RegistryError> {
        let (trigger_type, delivery_id) = match &run.trigger {
            RunTrigger::Webhook { delivery_id } => ("webhook", Some(delivery_id.as_str())),
            RunTrigger::Manual => ("manual", None),
        };

        sqlx::query(
            r#"
            INSERT INTO runs (id, repository, revision, image_repository, image_tag,
                              trigger_type, delivery_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id)
        .bind(&run.source.repository)
        .bind(&run.source.revision)
        .bind(&run.image.repository)
        .bind(&run.image.tag)
        .bind(trigger_type)
        .bind(delivery_id)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>, RegistryError> {
        let mut conn = self.pool.acquire().await?;
        Ok(load_run(&mut conn, id, false).await?)
    }

    async fn list(&self, status: Option<RunStatus>) -> Result<Vec<Run>, RegistryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, RunRow>(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE status = $1 ORDER BY created_at DESC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, RunRow>(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let task_rows = sqlx::query_as::<_, TaskRunRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM task_runs WHERE run_id = ANY($1) ORDER BY run_id, position"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut tasks_by_run: HashMap<Uuid, Vec<TaskRun>> = HashMap::new();
        for row in task_rows {
            tasks_by_run.entry(row.run_id).or_default().push(row.into());
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let tasks = tasks_by_run.remove(&row.id).unwrap_or_default();
                row.into_run(tasks)
            })
            .collect())
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), RegistryError> {
        self.mutate(id, apply_mark_running).await?;
        Ok(())
    }

    async fn record_task(&self, id: Uuid, task: &TaskRun) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await?;

        let mut run = load_run(&mut tx, id, true)
            .await?
            .ok_or(RegistryError::NotFound(id))?;
        let position = apply_record_task(&mut run, task)?;

        sqlx::query(
            r#"
            INSERT INTO task_runs (run_id, position, kind, status, started_at, completed_at,
                                   attempts, result, error_kind, error_detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (run_id, position) DO UPDATE
            SET status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                attempts = EXCLUDED.attempts,
                result = EXCLUDED.result,
                error_kind = EXCLUDED.error_kind,
                error_detail = EXCLUDED.error_detail
            "#,
        )
        .bind(id)
        .bind(position as i32)
        .bind(task.kind.as_str())
        .bind(task.status.as_str())
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.attempts as i32)
        .bind(&task.result)
        .bind(task.error.as_ref().map(|e| e.kind.as_str()))
        .bind(task.error.as_ref().map(|e| e.detail.as_str()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_artifacts(
        &self,
        id: Uuid,
        resolved_commit: Option<&str>,
        image_digest: Option<&str>,
    ) -> Result<(), RegistryError> {
        self.mutate(id, |run| apply_artifacts(run, resolved_commit, image_digest))
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        failure: Option<RunFailure>,
    ) -> Result<(), RegistryError> {
        self.mutate(id, move |run| apply_finish(run, status, failure))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn load_run(
    conn: &mut PgConnection,
    id: Uuid,
    for_update: bool,
) -> Result<Option<Run>, sqlx::Error> {
    let lock = if for_update { " FOR UPDATE" } else { "" };

    let row = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM runs WHERE id = $1{lock}"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let tasks = sqlx::query_as::<_, TaskRunRow>(&format!(
        "SELECT {TASK_COLUMNS} FROM task_runs WHERE run_id = $1 ORDER BY position"
    ))
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(row.into_run(tasks.into_iter().map(Into::into).collect())))
}

async fn write_run(conn: &mut PgConnection, run: &Run) -> Result<(), sqlx::Error> {
    let failure = run.failure.as_ref();

    sqlx::query(
        r#"
        UPDATE runs
        SET status = $1, started_at = $2, completed_at = $3, resolved_commit = $4,
            image_digest = $5, failure_task = $6, failure_kind = $7, failure_detail = $8
        WHERE id = $9
        "#,
    )
    .bind(run.status.as_str())
    .bind(run.started_at)
    .bind(run.completed_at)
    .bind(&run.resolved_commit)
    .bind(&run.image_digest)
    .bind(failure.and_then(|f| f.task).map(TaskKind::as_str))
    .bind(failure.map(|f| f.kind.as_str()))
    .bind(failure.map(|f| f.detail.as_str()))
    .bind(run.id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn string_to_status(s: &str) -> RunStatus {
    RunStatus::parse(s).unwrap_or(RunStatus::Failed)
}

fn string_to_kind(s: &str) -> ErrorKind {
    ErrorKind::parse(s).unwrap_or(ErrorKind::Internal)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    repository: String,
    revision: String,
    image_repository: String,
    image_tag: Option<String>,
    trigger_type: String,
    delivery_id: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    resolved_commit: Option<String>,
    image_digest: Option<String>,
    failure_task: Option<String>,
    failure_kind: Option<String>,
    failure_detail: Option<String>,
}

impl RunRow {
    fn into_run(self, tasks: Vec<TaskRun>) -> Run {
        let trigger = match (self.trigger_type.as_str(), self.delivery_id) {
            ("webhook", Some(delivery_id)) => RunTrigger::Webhook { delivery_id },
            _ => RunTrigger::Manual,
        };

        let failure = self.failure_kind.map(|kind| RunFailure {
            task: self.failure_task.as_deref().and_then(TaskKind::parse),
            kind: string_to_kind(&kind),
            detail: self.failure_detail.unwrap_or_default(),
        });

        Run {
            id: self.id,
            source: SourceRef {
                repository: self.repository,
                revision: self.revision,
            },
            image: ImageRef {
                repository: self.image_repository,
                tag: self.image_tag,
            },
            trigger,
            status: string_to_status(&self.status),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            tasks,
            resolved_commit: self.resolved_commit,
            image_digest: self.image_digest,
            failure,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TaskRunRow {
    run_id: Uuid,
    kind: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    attempts: i32,
    result: Option<serde_json::Value>,
    error_kind: Option<String>,
    error_detail: Option<String>,
}

impl From<TaskRunRow> for TaskRun {
    fn from(row: TaskRunRow) -> Self {
        TaskRun {
            kind: TaskKind::parse(&row.kind).unwrap_or(TaskKind::Clone),
            status: string_to_status(&row.status),
            started_at: row.started_at,
            completed_at: row.completed_at,
            attempts: row.attempts.max(0) as u32,
            result: row.result,
            error: row.error_kind.map(|kind| TaskFailure {
                kind: string_to_kind(&kind),
                detail: row.error_detail.unwrap_or_default(),
            }),
        }
    }
}
