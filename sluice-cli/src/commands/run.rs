//! Run command handlers
//!
//! Handles triggering, listing, inspecting and cancelling runs.

use anyhow::{Result, anyhow};
use clap::Subcommand;
use colored::*;
use sluice_client::OrchestratorClient;
use sluice_core::domain::run::{Run, RunStatus, RunTrigger};
use sluice_core::domain::task::TaskRun;
use sluice_core::dto::run::{RunSummary, TriggerRun};

use crate::config::Config;
use crate::id_resolver::resolve_run_id;
use crate::types::IdOrPrefix;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// Trigger a run for a revision
    Trigger {
        /// Branch, tag or commit to build
        #[arg(long)]
        revision: String,

        /// Repository clone URL (defaults to the orchestrator's configured repository)
        #[arg(long)]
        repo: Option<String>,

        /// Image tag (defaults to the resolved commit)
        #[arg(long)]
        tag: Option<String>,
    },
    /// List runs, newest first
    List {
        /// Only show runs in this status (pending, running, succeeded, failed, cancelled)
        #[arg(long)]
        status: Option<String>,
    },
    /// Get run details
    Get {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Cancel a queued or running run
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
}

/// Handle run commands
pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = config.client();

    match command {
        RunCommands::Trigger {
            revision,
            repo,
            tag,
        } => trigger_run(&client, revision, repo, tag).await,
        RunCommands::List { status } => list_runs(&client, status.as_deref()).await,
        RunCommands::Get { id } => get_run(&client, &id).await,
        RunCommands::Cancel { id } => cancel_run(&client, &id).await,
    }
}

async fn trigger_run(
    client: &OrchestratorClient,
    revision: String,
    repository: Option<String>,
    tag: Option<String>,
) -> Result<()> {
    let run = client
        .trigger_run(TriggerRun {
            repository,
            revision,
            tag,
        })
        .await?;

    println!("{}", "✓ Run triggered".green().bold());
    println!("  ID:       {}", run.id.to_string().cyan());
    println!("  Source:   {} @ {}", run.source.repository, run.source.revision);
    println!("  Status:   {}", colorize_status(run.status));

    Ok(())
}

async fn list_runs(client: &OrchestratorClient, status: Option<&str>) -> Result<()> {
    let status = status
        .map(|s| RunStatus::parse(s).ok_or_else(|| anyhow!("Unknown run status '{}'", s)))
        .transpose()?;

    let runs = client.list_runs(status).await?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
    } else {
        println!("{}", format!("Found {} run(s):", runs.len()).bold());
        println!();
        for run in &runs {
            print_run_summary(run);
        }
    }

    Ok(())
}

async fn get_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let run = client.get_run(uuid).await?;

    print_run_details(&run);

    Ok(())
}

async fn cancel_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;

    match client.cancel_run(uuid).await {
        Ok(run) if run.is_terminal() => {
            println!("{} Run {} cancelled", "✓".green(), uuid);
        }
        Ok(_) => {
            println!(
                "{} Cancellation requested for run {}; it stops at the next checkpoint",
                "✓".green(),
                uuid
            );
        }
        Err(e) if e.is_conflict() => {
            println!("{}", format!("Run {} has already finished", uuid).yellow());
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn print_run_summary(run: &RunSummary) {
    println!("  {} Run {}", "▸".cyan(), run.id.to_string().dimmed());
    println!("    Source:   {} @ {}", run.repository, run.revision);
    println!("    Status:   {}", colorize_status(run.status));
    if let Some(commit) = &run.resolved_commit {
        println!("    Commit:   {}", short_commit(commit).dimmed());
    }
    if let Some(kind) = run.failure_kind {
        match run.failed_task {
            Some(task) => println!("    Failure:  {} in {}", kind.as_str().red(), task),
            None => println!("    Failure:  {}", kind.as_str().red()),
        }
    }
    println!(
        "    Created:  {}",
        run.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_run_details(run: &Run) {
    println!("{}", "Run Details:".bold());
    println!("  ID:          {}", run.id.to_string().cyan());
    println!("  Status:      {}", colorize_status(run.status));
    println!("  Repository:  {}", run.source.repository);
    println!("  Revision:    {}", run.source.revision);
    match &run.trigger {
        RunTrigger::Webhook { delivery_id } => {
            println!("  Trigger:     webhook ({})", delivery_id.dimmed())
        }
        RunTrigger::Manual => println!("  Trigger:     manual"),
    }
    println!("  Created:     {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(started) = run.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(completed) = run.completed_at {
        println!("  Completed:   {}", completed.format("%Y-%m-%d %H:%M:%S"));

        if let Some(started) = run.started_at {
            let seconds = completed.signed_duration_since(started).num_seconds();
            println!("  Duration:    {}s", seconds);
        }
    }

    if let Some(commit) = &run.resolved_commit {
        println!("  Commit:      {}", commit);
    }
    if let Some(digest) = &run.image_digest {
        println!("  Image:       {}", run.image.pinned(digest).cyan());
    } else if let Some(tag) = &run.image.tag {
        println!("  Image:       {}", run.image.tagged(tag));
    }

    if !run.tasks.is_empty() {
        println!("\n{}", "Stages:".bold());
        for task in &run.tasks {
            print_task(task);
        }
    }

    if let Some(failure) = &run.failure {
        println!("\n{}", "Failure:".bold());
        match failure.task {
            Some(task) => println!("  {} in {}", failure.kind.as_str().red(), task),
            None => println!("  {}", failure.kind.as_str().red()),
        }
        println!("{}", failure.detail.red());
    }
}

fn print_task(task: &TaskRun) {
    let marker = match task.status {
        RunStatus::Succeeded => "✓".green(),
        RunStatus::Failed => "✗".red(),
        RunStatus::Cancelled => "-".dimmed(),
        RunStatus::Pending | RunStatus::Running => "…".cyan(),
    };

    let attempts = if task.attempts > 1 {
        format!(" ({} attempts)", task.attempts)
    } else {
        String::new()
    };
    println!(
        "  {} {:<11} {}{}",
        marker,
        task.kind.as_str(),
        colorize_status(task.status),
        attempts.dimmed()
    );

    if let Some(result) = &task.result {
        if let Ok(compact) = serde_json::to_string(result) {
            println!("      {}", compact.dimmed());
        }
    }
    if let Some(error) = &task.error {
        println!("      {}: {}", error.kind.as_str().red(), error.detail);
    }
}

fn short_commit(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}

/// Colorize run status for display
fn colorize_status(status: RunStatus) -> ColoredString {
    let status_str = status.as_str();
    match status {
        RunStatus::Pending => status_str.yellow(),
        RunStatus::Running => status_str.cyan(),
        RunStatus::Succeeded => status_str.green(),
        RunStatus::Failed => status_str.red(),
        RunStatus::Cancelled => status_str.dimmed(),
    }
}
