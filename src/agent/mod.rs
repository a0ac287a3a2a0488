//! Remote-host agent: an mTLS gRPC daemon executing deploys and container
//! operations against the local Docker on behalf of the control plane.

pub mod client;
mod deploy;
mod logbus;
mod pty;
mod service;
mod update;

pub use deploy::DeployEnv;
pub use logbus::LogBus;
pub use service::{AgentService, AGENT_VERSION};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{info, warn};

use crate::proto::agent::agent_server::AgentServer;
use crate::runtime::DockerCli;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub data_dir: PathBuf,
    pub registry: String,
}

/// Run the agent until SIGINT/SIGTERM.
pub async fn serve(options: AgentOptions) -> Result<()> {
    let cert = tokio::fs::read(&options.cert_path)
        .await
        .with_context(|| format!("Failed to read certificate {}", options.cert_path.display()))?;
    let key = tokio::fs::read(&options.key_path)
        .await
        .with_context(|| format!("Failed to read key {}", options.key_path.display()))?;
    let ca = tokio::fs::read(&options.ca_path)
        .await
        .with_context(|| format!("Failed to read CA {}", options.ca_path.display()))?;

    // Peers must present a certificate chaining to the server's root CA.
    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca));

    crate::utils::ensure_dir(&options.data_dir)?;

    let driver = Arc::new(DockerCli::new());
    if !driver.is_available().await {
        warn!("Docker daemon is not reachable; deploys will fail until it is");
    }

    let env = DeployEnv {
        data_dir: options.data_dir.clone(),
        registry: options.registry.clone(),
        health_grace_secs: 5,
        health_retries: 10,
        health_timeout_secs: 5,
    };
    let bus = Arc::new(LogBus::new());
    let service = AgentService::new(env, driver, bus);

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<AgentServer<AgentService>>()
        .await;

    let addr: SocketAddr = format!("0.0.0.0:{}", options.port)
        .parse()
        .context("Invalid listen address")?;

    info!(version = AGENT_VERSION, %addr, "Agent listening");

    Server::builder()
        .tls_config(tls)
        .context("Invalid TLS configuration")?
        .http2_keepalive_interval(Some(Duration::from_secs(10)))
        .http2_keepalive_timeout(Some(Duration::from_secs(5)))
        .tcp_keepalive(Some(Duration::from_secs(300)))
        .add_service(health_service)
        .add_service(AgentServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await
        .context("Agent gRPC server failed")?;

    info!("Agent stopped");
    Ok(())
}


async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
