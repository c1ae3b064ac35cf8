use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id UUID PRIMARY KEY,
            repository TEXT NOT NULL,
            revision TEXT NOT NULL,
            image_repository TEXT NOT NULL,
            image_tag TEXT,
            trigger_type VARCHAR(20) NOT NULL,
            delivery_id TEXT,
            status VARCHAR(20) NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            resolved_commit TEXT,
            image_digest TEXT,
            failure_task VARCHAR(20),
            failure_kind VARCHAR(40),
            failure_detail TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create task runs table, one row per started stage
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_runs (
            run_id UUID NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            kind VARCHAR(20) NOT NULL,
            status VARCHAR(20) NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            attempts INTEGER NOT NULL DEFAULT 0,
            result JSONB,
            error_kind VARCHAR(40),
            error_detail TEXT,
            PRIMARY KEY (run_id, position)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_delivery_id ON runs(delivery_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
