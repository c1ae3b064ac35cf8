//! Health command handler

use anyhow::{Context, Result};
use colored::*;

use crate::config::Config;

pub async fn show_health(config: &Config) -> Result<()> {
    let health = config
        .client()
        .health()
        .await
        .with_context(|| format!("Orchestrator at {} is unreachable", config.orchestrator_url))?;

    let status = if health.status == "ok" {
        health.status.green()
    } else {
        health.status.red()
    };

    println!("{}", "Orchestrator:".bold());
    println!("  URL:      {}", config.orchestrator_url.dimmed());
    println!("  Status:   {}", status);
    println!(
        "  Running:  {}/{}",
        health.running, health.max_concurrent_runs
    );
    println!("  Queued:   {}", health.queued);

    Ok(())
}
