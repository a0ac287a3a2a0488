//! The deploy pipeline as executed on a remote host.
//!
//! Mirrors the control plane's local pipeline, but state reporting differs:
//! log lines fan out through the agent's log bus to any `StreamDeployLogs`
//! subscription, and the terminal outcome travels back in the
//! `ExecuteDeploy` response instead of a database row.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::engine::compose;
use crate::engine::deploy_config::DeployConfig;
use crate::engine::RemoteDeploy;
use crate::error::Error;
use crate::exec::sanitize_path_fragment;
use crate::git::GitDriver;
use crate::runtime::{image_tag, ContainerDriver};

use super::logbus::LogBus;

/// Host-level knobs the agent pipeline needs.
#[derive(Debug, Clone)]
pub struct DeployEnv {
    pub data_dir: PathBuf,
    pub registry: String,
    pub health_grace_secs: u64,
    pub health_retries: u32,
    pub health_timeout_secs: u64,
}

pub async fn run(
    env: &DeployEnv,
    driver: &Arc<dyn ContainerDriver>,
    bus: &Arc<LogBus>,
    request: &RemoteDeploy,
) -> Result<String> {
    let git = GitDriver::new();
    let log = |line: &str| bus.publish(&request.deployment_id, line);

    let repo_dir = env.data_dir.join(&request.app_id);
    let app_dir = match request.workdir.as_str() {
        "" | "." => repo_dir.clone(),
        workdir => repo_dir.join(sanitize_path_fragment(workdir)),
    };

    let token = request.git_token.as_deref();
    if !repo_dir.join(".git").exists() {
        log(&format!("Cloning {}", request.repository_url));
        git.clone(&request.repository_url, &request.branch, &repo_dir, token)
            .await
            .map_err(|e| Error::GitSyncFailed(format!("{:#}", e)))?;
    }
    git.sync(
        &repo_dir,
        &request.commit_sha,
        Some(&request.repository_url),
        token,
    )
    .await
    .map_err(|e| Error::GitSyncFailed(format!("{:#}", e)))?;

    let sha = git.current_sha(&repo_dir).await?;
    log(&format!("Checked out {}", &sha[..sha.len().min(12)]));

    let config = DeployConfig::load(&app_dir).await?;
    let tag = image_tag(&env.registry, &request.app_name, &sha);

    log(&format!("Building image {}", tag));
    let sink = line_sink(bus.clone(), request.deployment_id.clone(), "[build]");
    driver
        .build(&app_dir, &config.dockerfile, &config.context, &tag, sink)
        .await
        .map_err(|e| Error::BuildFailed(format!("{:#}", e)))?;

    // Resolved env vars arrive from the server and win over the file.
    let mut merged: BTreeMap<String, String> = config.env.clone();
    for (key, value) in &request.env_vars {
        merged.insert(key.clone(), value.clone());
    }
    let domains = compose::collect_domains(&config.domains, &request.domains);
    let rendered = compose::render(&request.app_name, &tag, &config, merged, &domains)?;
    tokio::fs::write(app_dir.join("docker-compose.yml"), rendered)
        .await
        .context("Failed to write docker-compose.yml")?;

    log("Starting service");
    let sink = line_sink(bus.clone(), request.deployment_id.clone(), "[deploy]");
    driver.compose_up(&app_dir, &request.app_id, sink).await?;

    health_check(env, &config, &log).await?;
    log("Health check passed");

    Ok(tag)
}

async fn health_check(
    env: &DeployEnv,
    config: &DeployConfig,
    log: &impl Fn(&str),
) -> Result<()> {
    let port = config.host_port.unwrap_or(config.port);
    let url = format!("http://localhost:{}{}", port, config.healthcheck_path);
    log(&format!("Waiting for {}", url));

    tokio::time::sleep(Duration::from_secs(env.health_grace_secs)).await;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(env.health_timeout_secs))
        .build()
        .context("Failed to build health check client")?;

    let mut delay = Duration::from_secs(1);
    for attempt in 1..=env.health_retries {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => log(&format!(
                "Health check attempt {}: status {}",
                attempt,
                resp.status()
            )),
            Err(e) => log(&format!("Health check attempt {}: {}", attempt, e)),
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(30));
    }

    Err(Error::HealthCheckFailed(format!(
        "no successful response from {} after {} attempts",
        url, env.health_retries
    ))
    .into())
}

fn line_sink(bus: Arc<LogBus>, deployment_id: String, prefix: &str) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let prefix = prefix.to_string();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            bus.publish(&deployment_id, &format!("{} {}", prefix, line));
        }
    });
    tx
}
