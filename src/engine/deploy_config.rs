//! Per-app deploy configuration (`paasdeploy.json` at the app workdir root).
//!
//! A missing file is not an error: every field has a default that yields a
//! working single-container deployment. Unknown keys are tolerated so apps
//! can carry forward-compatible configuration.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "paasdeploy.json";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployConfigFile {
    pub name: Option<String>,
    pub build: BuildSection,
    pub healthcheck: HealthcheckSection,
    pub port: Option<u16>,
    pub host_port: Option<u16>,
    pub env: BTreeMap<String, String>,
    pub domains: Vec<String>,
    pub resources: ResourcesSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildSection {
    #[serde(rename = "type")]
    pub build_type: Option<String>,
    pub dockerfile: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthcheckSection {
    pub path: Option<String>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
    pub retries: Option<u32>,
    pub start_period: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourcesSection {
    pub memory: Option<String>,
    pub cpu: Option<String>,
}

/// The resolved configuration the worker actually uses, with all defaults
/// applied after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployConfig {
    pub build_type: String,
    pub dockerfile: String,
    pub context: String,
    pub port: u16,
    pub host_port: Option<u16>,
    pub healthcheck_path: String,
    pub healthcheck_interval_secs: u64,
    pub healthcheck_timeout_secs: u64,
    pub healthcheck_retries: u32,
    pub healthcheck_start_period_secs: u64,
    pub env: BTreeMap<String, String>,
    pub domains: Vec<String>,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl DeployConfigFile {
    pub fn resolve(self) -> DeployConfig {
        DeployConfig {
            build_type: non_empty(self.build.build_type).unwrap_or_else(|| "dockerfile".into()),
            dockerfile: non_empty(self.build.dockerfile).unwrap_or_else(|| "./Dockerfile".into()),
            context: non_empty(self.build.context).unwrap_or_else(|| ".".into()),
            port: self.port.unwrap_or(8080),
            host_port: self.host_port,
            healthcheck_path: non_empty(self.healthcheck.path).unwrap_or_else(|| "/health".into()),
            healthcheck_interval_secs: self.healthcheck.interval.unwrap_or(30),
            healthcheck_timeout_secs: self.healthcheck.timeout.unwrap_or(5),
            healthcheck_retries: self.healthcheck.retries.unwrap_or(3),
            healthcheck_start_period_secs: self.healthcheck.start_period.unwrap_or(10),
            env: self.env,
            domains: self.domains,
            memory_limit: non_empty(self.resources.memory),
            cpu_limit: non_empty(self.resources.cpu),
        }
    }
}

impl DeployConfig {
    /// Load from `<app_dir>/paasdeploy.json`. Absent file yields defaults;
    /// a file that exists but does not parse is a real error.
    pub async fn load(app_dir: &Path) -> Result<Self> {
        let path = app_dir.join(CONFIG_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let file: DeployConfigFile = serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                Ok(file.resolve())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(DeployConfigFile::default().resolve())
            }
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = DeployConfigFile::default().resolve();
        assert_eq!(config.port, 8080);
        assert_eq!(config.build_type, "dockerfile");
        assert_eq!(config.dockerfile, "./Dockerfile");
        assert_eq!(config.context, ".");
        assert_eq!(config.healthcheck_path, "/health");
    }

    #[test]
    fn test_empty_strings_fall_back_to_defaults() {
        let file: DeployConfigFile = serde_json::from_str(
            r#"{"build": {"type": "", "dockerfile": " "}, "healthcheck": {"path": ""}}"#,
        )
        .unwrap();
        let config = file.resolve();
        assert_eq!(config.build_type, "dockerfile");
        assert_eq!(config.dockerfile, "./Dockerfile");
        assert_eq!(config.healthcheck_path, "/health");
    }

    #[test]
    fn test_unknown_keys_tolerated() {
        let file: DeployConfigFile = serde_json::from_str(
            r#"{"port": 3000, "someFutureKey": {"nested": true}, "env": {"A": "1"}}"#,
        )
        .unwrap();
        let config = file.resolve();
        assert_eq!(config.port, 3000);
        assert_eq!(config.env.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_full_document() {
        let file: DeployConfigFile = serde_json::from_str(
            r#"{
                "name": "demo",
                "build": {"type": "dockerfile", "dockerfile": "./docker/Dockerfile", "context": "."},
                "healthcheck": {"path": "/healthz", "interval": 10, "timeout": 3, "retries": 5, "startPeriod": 20},
                "port": 9000,
                "hostPort": 19000,
                "env": {"MODE": "prod"},
                "domains": ["demo.example.com"],
                "resources": {"memory": "512m", "cpu": "0.5"}
            }"#,
        )
        .unwrap();
        let config = file.resolve();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host_port, Some(19000));
        assert_eq!(config.healthcheck_path, "/healthz");
        assert_eq!(config.healthcheck_start_period_secs, 20);
        assert_eq!(config.domains, vec!["demo.example.com"]);
        assert_eq!(config.memory_limit.as_deref(), Some("512m"));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DeployConfig::load(tmp.path()).await.unwrap();
        assert_eq!(config.port, 8080);
    }

    #[tokio::test]
    async fn test_malformed_file_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE), "{not json")
            .await
            .unwrap();
        assert!(DeployConfig::load(tmp.path()).await.is_err());
    }
}
