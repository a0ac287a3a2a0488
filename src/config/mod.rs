use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub grpc: GrpcConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Public hostname of this control plane. Placed in the gRPC server
    /// certificate SAN and handed to agents during provisioning.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Registry prefix for built images. Empty means local-only tags.
    #[serde(default)]
    pub registry: String,
    /// Static agent binary served by the one-time download endpoint.
    #[serde(default = "default_agent_binary_path")]
    pub agent_binary_path: PathBuf,
    /// Secret for encrypting SSH credentials at rest. If not set, the
    /// credentials are stored in plaintext (backwards compatible).
    pub encryption_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            data_dir: default_data_dir(),
            public_host: default_public_host(),
            registry: String::new(),
            agent_binary_path: default_agent_binary_path(),
            encryption_key: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_agent_binary_path() -> PathBuf {
    PathBuf::from("./paasdeploy-agent")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    /// Number of concurrent deploy workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds between queue polls when no work is pending.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// Hard ceiling for one deploy run, in seconds.
    #[serde(default = "default_deploy_timeout_secs")]
    pub timeout_secs: u64,
    /// Grace before the first health probe after compose up, in seconds.
    #[serde(default = "default_health_grace_secs")]
    pub health_grace_secs: u64,
    /// Health probe attempts before the deploy is failed.
    #[serde(default = "default_health_retries")]
    pub health_retries: u32,
    /// Per-attempt health probe timeout, in seconds.
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    /// Health monitor sweep interval, in seconds.
    #[serde(default = "default_health_sweep_secs")]
    pub health_sweep_secs: u64,
    /// Stats monitor sweep interval, in seconds.
    #[serde(default = "default_stats_sweep_secs")]
    pub stats_sweep_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_secs: default_poll_secs(),
            timeout_secs: default_deploy_timeout_secs(),
            health_grace_secs: default_health_grace_secs(),
            health_retries: default_health_retries(),
            health_timeout_secs: default_health_timeout_secs(),
            health_sweep_secs: default_health_sweep_secs(),
            stats_sweep_secs: default_stats_sweep_secs(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_poll_secs() -> u64 {
    5
}

fn default_deploy_timeout_secs() -> u64 {
    1800
}

fn default_health_grace_secs() -> u64 {
    5
}

fn default_health_retries() -> u32 {
    10
}

fn default_health_timeout_secs() -> u64 {
    5
}

fn default_health_sweep_secs() -> u64 {
    30
}

fn default_stats_sweep_secs() -> u64 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrpcConfig {
    /// Port agents listen on for the control channel.
    #[serde(default = "default_grpc_port")]
    pub port: u16,
    /// Disable server-name verification when dialing agents. Lab use only.
    #[serde(default)]
    pub agent_tls_insecure_skip_verify: bool,
    /// Seconds between HTTP/2 keepalive pings.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// Seconds to wait for a keepalive ack before closing the connection.
    #[serde(default = "default_keepalive_timeout_secs")]
    pub keepalive_timeout_secs: u64,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            port: default_grpc_port(),
            agent_tls_insecure_skip_verify: false,
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_timeout_secs: default_keepalive_timeout_secs(),
        }
    }
}

fn default_grpc_port() -> u16 {
    50051
}

fn default_keepalive_interval_secs() -> u64 {
    10
}

fn default_keepalive_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookConfig {
    /// Secret for verifying GitHub webhook signatures (HMAC-SHA256)
    pub github_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse configuration file")?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides recognized by both binaries.
    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("DEPLOY_DATA_DIR") {
            if !dir.is_empty() {
                self.server.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(registry) = std::env::var("DOCKER_REGISTRY") {
            self.server.registry = registry;
        }
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            deploy: DeployConfig::default(),
            grpc: GrpcConfig::default(),
            webhooks: WebhookConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.api_port, 8080);
        assert_eq!(config.deploy.workers, 4);
        assert_eq!(config.deploy.poll_secs, 5);
        assert_eq!(config.grpc.port, 50051);
        assert!(!config.grpc.agent_tls_insecure_skip_verify);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [deploy]
            workers = 2

            [webhooks]
            github_secret = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.deploy.workers, 2);
        assert_eq!(config.deploy.poll_secs, 5);
        assert_eq!(config.webhooks.github_secret.as_deref(), Some("s3cret"));
    }
}
