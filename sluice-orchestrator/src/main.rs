use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod db;
pub mod executor;
pub mod repository;
pub mod service;
pub mod workspace;

use config::Config;
use executor::{
    BuildPushTask, CloneTask, DeployTask, GitFetcher, KubectlTarget, PodmanBuilder, Stages,
};
use repository::{MemoryRunRegistry, PgRunRegistry, RunRegistry};
use service::{PipelineEngine, RunScheduler, WebhookReceiver, recovery};
use workspace::WorkspaceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Sluice Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let registry: Arc<dyn RunRegistry> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(database_url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            Arc::new(PgRunRegistry::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; run history will not survive a restart");
            Arc::new(MemoryRunRegistry::new())
        }
    };

    let workspaces = Arc::new(WorkspaceManager::new(
        config.workspace_root.clone(),
        config.workspace_capacity,
    ));

    let stages = Stages::new(
        Arc::new(CloneTask::new(Arc::new(GitFetcher::new(
            config.git_bin.clone(),
            config.command_timeout,
        )))),
        Arc::new(BuildPushTask::new(
            Arc::new(PodmanBuilder::new(
                config.container_bin.clone(),
                config.command_timeout,
            )),
            config.registry.clone(),
            config.build_descriptor.clone(),
            config.retry_policy(),
        )),
        Arc::new(DeployTask::new(
            Arc::new(KubectlTarget::new(
                config.kubectl_bin.clone(),
                config.deploy_namespace.clone(),
                config.deploy_name.clone(),
                config.deploy_container.clone(),
                config.command_timeout,
            )),
            config.rollout_timeout,
            config.rollout_poll_interval,
        )),
    );

    let engine = Arc::new(PipelineEngine::new(
        registry.clone(),
        workspaces.clone(),
        stages,
    ));
    let scheduler = RunScheduler::new(registry.clone(), engine, config.max_concurrent_runs);

    recovery::recover(&registry, &workspaces, &scheduler)
        .await
        .context("Startup recovery failed")?;

    let webhook = Arc::new(WebhookReceiver::new(
        config.webhook_secret.clone(),
        config.deploy_branch.clone(),
        config.image_repository.clone(),
        config.delivery_retention,
        scheduler.clone(),
    ));

    // Build router with all API endpoints
    let app = api::create_router(api::AppState {
        registry,
        scheduler,
        webhook,
        source_repository: config.source_repository.clone(),
        image_repository: config.image_repository.clone(),
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Sluice Orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
