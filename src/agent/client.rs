//! Control-plane side of the control channel: dial agents over mTLS, run
//! remote deploys with live log forwarding, and proxy container operations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::{debug, warn};

use crate::config::GrpcConfig;
use crate::db::{DbPool, Server, ServerStatus};
use crate::engine::{RemoteDeploy, RemoteDeployOutcome, RemoteDeployer};
use crate::notifier::Notifier;
use crate::pki::CaHolder;
use crate::proto::agent::agent_client::AgentClient;
use crate::proto::agent::{
    DeployLogsRequest, DeployRequest, DomainBinding, SystemInfoRequest, SystemInfoResponse,
};
use crate::queue::DeployQueue;
use crate::utils::now_rfc3339;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentPool {
    db: DbPool,
    ca: Arc<CaHolder>,
    grpc: GrpcConfig,
    public_host: String,
    queue: Arc<DeployQueue>,
    notifier: Arc<Notifier>,
}

impl AgentPool {
    pub fn new(
        db: DbPool,
        ca: Arc<CaHolder>,
        grpc: GrpcConfig,
        public_host: String,
        queue: Arc<DeployQueue>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            db,
            ca,
            grpc,
            public_host,
            queue,
            notifier,
        }
    }

    async fn server(&self, server_id: &str) -> Result<Server> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ?")
            .bind(server_id)
            .fetch_optional(&self.db)
            .await?
            .with_context(|| format!("server {} not found", server_id))
    }

    /// Dial an agent with a fresh client identity signed by the root CA.
    pub async fn connect(&self, server: &Server) -> Result<AgentClient<Channel>> {
        let identity = self
            .ca
            .issue_server_cert(&self.public_host)
            .context("Failed to issue client identity")?;

        let mut tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(self.ca.cert_pem()))
            .identity(Identity::from_pem(identity.cert_pem, identity.key_pem));

        // The agent's leaf carries its host as SAN. The insecure flag exists
        // for lab setups where agents sit behind NAT and present a
        // localhost SAN instead.
        tls = if self.grpc.agent_tls_insecure_skip_verify {
            warn!(server = %server.name, "Agent TLS server-name verification relaxed (lab mode)");
            tls.domain_name("localhost")
        } else {
            tls.domain_name(server.host.clone())
        };

        let endpoint = Channel::from_shared(format!("https://{}:{}", server.host, self.grpc.port))
            .context("Invalid agent endpoint")?
            .tls_config(tls)
            .context("Invalid agent TLS configuration")?
            .connect_timeout(CONNECT_TIMEOUT)
            .http2_keep_alive_interval(Duration::from_secs(self.grpc.keepalive_interval_secs))
            .keep_alive_timeout(Duration::from_secs(self.grpc.keepalive_timeout_secs))
            .keep_alive_while_idle(true);

        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("Failed to connect to agent at {}", server.host))?;

        Ok(AgentClient::new(channel))
    }

    /// Fetch system info and record the heartbeat on the server row.
    pub async fn probe(&self, server: &Server) -> Result<SystemInfoResponse> {
        let mut client = self.connect(server).await?;
        let info = client
            .get_system_info(SystemInfoRequest {})
            .await
            .context("GetSystemInfo failed")?
            .into_inner();

        sqlx::query(
            "UPDATE servers SET status = ?, agent_version = ?, last_heartbeat_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(ServerStatus::Online.as_str())
        .bind(&info.agent_version)
        .bind(now_rfc3339())
        .bind(now_rfc3339())
        .bind(&server.id)
        .execute(&self.db)
        .await?;

        Ok(info)
    }
}

#[async_trait]
impl RemoteDeployer for AgentPool {
    async fn execute_deploy(
        &self,
        server_id: &str,
        request: RemoteDeploy,
    ) -> Result<RemoteDeployOutcome> {
        let server = self.server(server_id).await?;
        let mut client = self.connect(&server).await?;

        // Subscribe to the live log stream before kicking off the deploy so
        // no early lines are missed; the agent closes the stream when the
        // deploy finishes.
        let mut log_client = client.clone();
        let queue = self.queue.clone();
        let notifier = self.notifier.clone();
        let deployment_id = request.deployment_id.clone();
        let app_id = request.app_id.clone();
        let log_task = tokio::spawn(async move {
            let mut stream = match log_client
                .stream_deploy_logs(DeployLogsRequest {
                    deployment_id: deployment_id.clone(),
                })
                .await
            {
                Ok(response) => response.into_inner(),
                Err(e) => {
                    warn!(error = %e, "Could not subscribe to remote deploy logs");
                    return;
                }
            };
            loop {
                match stream.message().await {
                    Ok(Some(line)) => {
                        let _ = queue
                            .append_logs(&deployment_id, &format!("{}\n", line.line))
                            .await;
                        notifier.log_line(&app_id, &deployment_id, &line.line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "Remote log stream ended");
                        break;
                    }
                }
            }
        });

        let wire_request = DeployRequest {
            deployment_id: request.deployment_id,
            app_id: request.app_id,
            app_name: request.app_name,
            repository_url: request.repository_url,
            branch: request.branch,
            commit_sha: request.commit_sha,
            workdir: request.workdir,
            env_vars: request.env_vars.into_iter().collect(),
            git_token: request.git_token.unwrap_or_default(),
            domains: request
                .domains
                .into_iter()
                .map(|(domain, path_prefix)| DomainBinding {
                    domain,
                    path_prefix,
                })
                .collect(),
        };

        let response = client
            .execute_deploy(wire_request)
            .await
            .context("ExecuteDeploy RPC failed")?
            .into_inner();

        // The agent closed the log bus; let the forwarder drain.
        let _ = log_task.await;

        Ok(RemoteDeployOutcome {
            success: response.success,
            image_tag: response.image_tag,
            error: response.error,
        })
    }
}
