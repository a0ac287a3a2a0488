//! Materialization of an app's `docker-compose.yml`.
//!
//! One service per app: container name = app name, attached to the shared
//! `paasdeploy` network, labeled for the edge proxy. The rendered file lives
//! next to the checkout and is what `docker compose` runs against.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::db::{CustomDomain, EnvVar};
use crate::runtime::SHARED_NETWORK;

use super::deploy_config::DeployConfig;

#[derive(Debug, Serialize)]
pub struct ComposeFile {
    pub services: BTreeMap<String, ComposeService>,
    pub networks: BTreeMap<String, ComposeNetwork>,
}

#[derive(Debug, Serialize)]
pub struct ComposeService {
    pub image: String,
    pub container_name: String,
    pub restart: String,
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    pub healthcheck: ComposeHealthcheck,
    pub networks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ComposeHealthcheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
    pub start_period: String,
}

#[derive(Debug, Serialize)]
pub struct ComposeNetwork {
    pub external: bool,
}

/// DB-stored variables override file-provided ones on key collision.
pub fn merge_env(
    file_env: &BTreeMap<String, String>,
    db_vars: &[EnvVar],
) -> BTreeMap<String, String> {
    let mut merged = file_env.clone();
    for var in db_vars {
        merged.insert(var.key.clone(), var.value.clone());
    }
    merged
}

/// Normalize a DB custom-domain row into a `(domain, path_prefix)` pair.
pub fn domain_pair(domain: &CustomDomain) -> (String, String) {
    let prefix = if domain.path_prefix.is_empty() {
        "/".to_string()
    } else {
        domain.path_prefix.clone()
    };
    (domain.domain.clone(), prefix)
}

/// Union of config-file domains (implicit "/" prefix) and externally-bound
/// pairs, deduplicated by `(domain, path_prefix)` with order preserved.
pub fn collect_domains(
    config_domains: &[String],
    extra: &[(String, String)],
) -> Vec<(String, String)> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::new();

    for domain in config_domains {
        let pair = (domain.clone(), "/".to_string());
        if seen.insert(pair.clone()) {
            result.push(pair);
        }
    }
    for (domain, prefix) in extra {
        let prefix = if prefix.is_empty() { "/" } else { prefix.as_str() };
        let pair = (domain.clone(), prefix.to_string());
        if seen.insert(pair.clone()) {
            result.push(pair);
        }
    }
    result
}

/// Edge-proxy labels for the container, one router per domain binding.
pub fn proxy_labels(app_name: &str, port: u16, domains: &[(String, String)]) -> Vec<String> {
    if domains.is_empty() {
        return Vec::new();
    }

    let mut labels = vec![
        "traefik.enable=true".to_string(),
        format!("traefik.docker.network={}", SHARED_NETWORK),
        format!(
            "traefik.http.services.{}.loadbalancer.server.port={}",
            app_name, port
        ),
    ];
    for (index, (domain, prefix)) in domains.iter().enumerate() {
        let rule = if prefix == "/" {
            format!("Host(`{}`)", domain)
        } else {
            format!("Host(`{}`) && PathPrefix(`{}`)", domain, prefix)
        };
        labels.push(format!(
            "traefik.http.routers.{}-{}.rule={}",
            app_name, index, rule
        ));
    }
    labels
}

/// Render the compose document for one app deployment.
pub fn render(
    app_name: &str,
    image: &str,
    config: &DeployConfig,
    env: BTreeMap<String, String>,
    domains: &[(String, String)],
) -> Result<String> {
    let host_port = config.host_port.unwrap_or(config.port);

    let service = ComposeService {
        image: image.to_string(),
        container_name: app_name.to_string(),
        restart: "unless-stopped".to_string(),
        ports: vec![format!("{}:{}", host_port, config.port)],
        environment: env,
        labels: proxy_labels(app_name, config.port, domains),
        healthcheck: ComposeHealthcheck {
            test: vec![
                "CMD-SHELL".to_string(),
                format!(
                    "curl -fsS http://localhost:{}{} || exit 1",
                    config.port, config.healthcheck_path
                ),
            ],
            interval: format!("{}s", config.healthcheck_interval_secs),
            timeout: format!("{}s", config.healthcheck_timeout_secs),
            retries: config.healthcheck_retries,
            start_period: format!("{}s", config.healthcheck_start_period_secs),
        },
        networks: vec![SHARED_NETWORK.to_string()],
        mem_limit: config.memory_limit.clone(),
        cpus: config.cpu_limit.clone(),
    };

    let mut services = BTreeMap::new();
    services.insert(app_name.to_string(), service);

    let mut networks = BTreeMap::new();
    networks.insert(SHARED_NETWORK.to_string(), ComposeNetwork { external: true });

    serde_yaml::to_string(&ComposeFile { services, networks })
        .context("Failed to render docker-compose.yml")
}

/// Rewrite the edge-proxy labels of an already-rendered compose document,
/// leaving everything else (env, ports, image) untouched. Returns the new
/// YAML and the container port the service publishes.
pub fn patch_labels(yaml: &str, app_name: &str, domains: &[(String, String)]) -> Result<String> {
    let mut doc: serde_yaml::Value =
        serde_yaml::from_str(yaml).context("Failed to parse existing docker-compose.yml")?;

    let service = doc
        .get_mut("services")
        .and_then(|s| s.get_mut(app_name))
        .with_context(|| format!("Service {} not found in compose file", app_name))?;

    let port = service
        .get("ports")
        .and_then(|p| p.get(0))
        .and_then(|p| p.as_str())
        .and_then(|p| p.rsplit(':').next())
        .and_then(|p| p.parse::<u16>().ok())
        .context("Compose file has no parseable port mapping")?;

    let labels = proxy_labels(app_name, port, domains);
    let mapping = service
        .as_mapping_mut()
        .context("Service entry is not a mapping")?;
    if labels.is_empty() {
        mapping.remove(&serde_yaml::Value::from("labels"));
    } else {
        mapping.insert(
            serde_yaml::Value::from("labels"),
            serde_yaml::to_value(labels).context("Failed to encode labels")?,
        );
    }

    serde_yaml::to_string(&doc).context("Failed to render patched docker-compose.yml")
}
