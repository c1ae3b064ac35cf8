//! Orchestrator configuration
//!
//! Every knob is read from `SLUICE_*` environment variables (plus
//! `DATABASE_URL`). Secrets may be given inline or as a path to a file, so
//! they can be mounted from a secret store instead of living in the
//! environment.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::executor::{RegistryCredential, RetryPolicy};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// Postgres connection string; the in-memory registry is used when unset
    pub database_url: Option<String>,

    /// Shared secret for webhook signatures
    pub webhook_secret: String,

    /// Only pushes to this branch trigger runs
    pub deploy_branch: String,

    /// Repository used by manual triggers that name none
    pub source_repository: Option<String>,

    /// Image repository runs push to, e.g. `registry.example.com/team/app`
    pub image_repository: String,

    /// Registry login; pushes are anonymous when unset
    pub registry: Option<RegistryCredential>,

    /// Admission bound: runs executing at once
    pub max_concurrent_runs: usize,

    pub workspace_root: PathBuf,
    pub workspace_capacity: usize,

    /// How long a delivery id is remembered for duplicate detection
    pub delivery_retention: Duration,

    /// Push retries after the first attempt
    pub push_retries: u32,

    /// Upper bound for any single external command
    pub command_timeout: Duration,

    pub deploy_namespace: String,
    pub deploy_name: String,
    pub deploy_container: String,
    pub rollout_timeout: Duration,
    pub rollout_poll_interval: Duration,

    pub git_bin: String,
    pub container_bin: String,
    pub kubectl_bin: String,

    /// Build descriptor path relative to the repository root;
    /// `Containerfile` then `Dockerfile` when unset
    pub build_descriptor: Option<String>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(webhook_secret: String, image_repository: String, deploy_name: String) -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            webhook_secret,
            deploy_branch: "main".to_string(),
            source_repository: None,
            image_repository,
            registry: None,
            max_concurrent_runs: 2,
            workspace_root: PathBuf::from("/tmp/sluice-workspaces"),
            workspace_capacity: 4,
            delivery_retention: Duration::from_secs(3600),
            push_retries: 2,
            command_timeout: Duration::from_secs(600),
            deploy_namespace: "default".to_string(),
            deploy_container: deploy_name.clone(),
            deploy_name,
            rollout_timeout: Duration::from_secs(300),
            rollout_poll_interval: Duration::from_secs(5),
            git_bin: "git".to_string(),
            container_bin: "podman".to_string(),
            kubectl_bin: "kubectl".to_string(),
            build_descriptor: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Required:
    /// - SLUICE_WEBHOOK_SECRET or SLUICE_WEBHOOK_SECRET_FILE
    /// - SLUICE_IMAGE_REPOSITORY
    /// - SLUICE_DEPLOY_NAME
    ///
    /// Everything else falls back to the defaults of [`Config::new`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let webhook_secret = secret(&var, "SLUICE_WEBHOOK_SECRET")?.ok_or_else(|| {
            anyhow::anyhow!("SLUICE_WEBHOOK_SECRET or SLUICE_WEBHOOK_SECRET_FILE must be set")
        })?;

        let image_repository = var("SLUICE_IMAGE_REPOSITORY")
            .ok_or_else(|| anyhow::anyhow!("SLUICE_IMAGE_REPOSITORY environment variable not set"))?;

        let deploy_name = var("SLUICE_DEPLOY_NAME")
            .ok_or_else(|| anyhow::anyhow!("SLUICE_DEPLOY_NAME environment variable not set"))?;

        let mut config = Self::new(webhook_secret, image_repository, deploy_name);

        if let Some(addr) = var("SLUICE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.database_url = var("DATABASE_URL");
        if let Some(branch) = var("SLUICE_DEPLOY_BRANCH") {
            config.deploy_branch = branch;
        }
        config.source_repository = var("SLUICE_SOURCE_REPOSITORY");

        let server = var("SLUICE_REGISTRY_SERVER");
        let username = var("SLUICE_REGISTRY_USERNAME");
        let token = secret(&var, "SLUICE_REGISTRY_TOKEN")?;
        config.registry = match (server, username, token) {
            (Some(server), Some(username), Some(token)) => Some(RegistryCredential {
                server,
                username,
                token,
            }),
            (None, None, None) => None,
            _ => anyhow::bail!(
                "SLUICE_REGISTRY_SERVER, SLUICE_REGISTRY_USERNAME and SLUICE_REGISTRY_TOKEN must be set together"
            ),
        };

        config.max_concurrent_runs =
            parsed(&var, "SLUICE_MAX_CONCURRENT_RUNS", config.max_concurrent_runs)?;
        if let Some(root) = var("SLUICE_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        config.workspace_capacity =
            parsed(&var, "SLUICE_WORKSPACE_CAPACITY", config.workspace_capacity)?;
        config.delivery_retention =
            seconds(&var, "SLUICE_DELIVERY_RETENTION", config.delivery_retention)?;
        config.push_retries = parsed(&var, "SLUICE_PUSH_RETRIES", config.push_retries)?;
        config.command_timeout = seconds(&var, "SLUICE_COMMAND_TIMEOUT", config.command_timeout)?;

        if let Some(namespace) = var("SLUICE_DEPLOY_NAMESPACE") {
            config.deploy_namespace = namespace;
        }
        if let Some(container) = var("SLUICE_DEPLOY_CONTAINER") {
            config.deploy_container = container;
        }
        config.rollout_timeout = seconds(&var, "SLUICE_ROLLOUT_TIMEOUT", config.rollout_timeout)?;
        config.rollout_poll_interval = seconds(
            &var,
            "SLUICE_ROLLOUT_POLL_INTERVAL",
            config.rollout_poll_interval,
        )?;

        if let Some(bin) = var("SLUICE_GIT_BIN") {
            config.git_bin = bin;
        }
        if let Some(bin) = var("SLUICE_CONTAINER_BIN") {
            config.container_bin = bin;
        }
        if let Some(bin) = var("SLUICE_KUBECTL_BIN") {
            config.kubectl_bin = bin;
        }
        config.build_descriptor = var("SLUICE_BUILD_DESCRIPTOR");

        Ok(config)
    }

    /// Backoff policy for the push stage
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.push_retries)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        self.bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address '{}'", self.bind_addr))?;

        if self.webhook_secret.is_empty() {
            anyhow::bail!("webhook_secret cannot be empty");
        }

        if self.image_repository.is_empty() || self.image_repository.contains(char::is_whitespace)
        {
            anyhow::bail!("image_repository must be a registry path without whitespace");
        }

        if self.image_repository.contains('@') {
            anyhow::bail!("image_repository must not carry a digest");
        }

        if self.deploy_branch.is_empty() {
            anyhow::bail!("deploy_branch cannot be empty");
        }

        if self.deploy_name.is_empty() || self.deploy_container.is_empty() {
            anyhow::bail!("deploy_name and deploy_container cannot be empty");
        }

        if self.max_concurrent_runs == 0 {
            anyhow::bail!("max_concurrent_runs must be greater than 0");
        }

        if self.workspace_capacity < self.max_concurrent_runs {
            anyhow::bail!(
                "workspace_capacity ({}) must be at least max_concurrent_runs ({})",
                self.workspace_capacity,
                self.max_concurrent_runs
            );
        }

        if self.rollout_poll_interval.is_zero() {
            anyhow::bail!("rollout_poll_interval must be greater than 0");
        }

        if self.rollout_timeout < self.rollout_poll_interval {
            anyhow::bail!("rollout_timeout must be at least rollout_poll_interval");
        }

        if self.command_timeout.is_zero() {
            anyhow::bail!("command_timeout must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            "insecure-dev-secret".to_string(),
            "localhost:5000/app".to_string(),
            "app".to_string(),
        )
    }
}

/// Reads `key`, or the contents of the file named by `<key>_FILE`
fn secret<F>(var: &F, key: &str) -> Result<Option<String>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = var(key) {
        return Ok(Some(value));
    }

    let file_key = format!("{}_FILE", key);
    match var(&file_key) {
        Some(path) => {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {} from {}", key, path))?;
            Ok(Some(contents.trim().to_string()))
        }
        None => Ok(None),
    }
}

fn parsed<F, T>(var: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has invalid value '{}'", key, value)),
        None => Ok(default),
    }
}

fn seconds<F>(var: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(var, key, default.as_secs()).map(Duration::from_secs)
}
