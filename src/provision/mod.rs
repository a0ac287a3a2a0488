//! First-boot provisioning of a remote host over SSH.
//!
//! Installs the agent binary through a one-time download token, drops the
//! root CA and a freshly-issued leaf certificate, writes a systemd unit,
//! starts it, and polls the control channel until the agent reports in.
//! The host key is pinned on first contact and strictly matched afterwards.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use openssh::{KnownHosts, Session, SessionBuilder};
use tracing::{error, info, warn};

use crate::agent::client::AgentPool;
use crate::crypto;
use crate::db::{DbPool, Server, ServerStatus};
use crate::exec;
use crate::pki::CaHolder;
use crate::utils::{new_id, now_rfc3339};

const REMOTE_CONFIG_DIR: &str = "/etc/paasdeploy";
const REMOTE_BINARY: &str = "/usr/local/bin/paasdeploy-agent";
const REMOTE_DATA_DIR: &str = "/var/lib/paasdeploy";
const UNIT_PATH: &str = "/etc/systemd/system/paasdeploy-agent.service";

const DOWNLOAD_TOKEN_TTL_MINUTES: i64 = 15;
const READINESS_ATTEMPTS: u32 = 30;
const READINESS_DELAY: Duration = Duration::from_secs(2);

pub struct Provisioner {
    db: DbPool,
    ca: Arc<CaHolder>,
    public_host: String,
    api_port: u16,
    grpc_port: u16,
    agent_binary_path: String,
    encryption_key: Option<[u8; crypto::KEY_LENGTH]>,
}

impl Provisioner {
    pub fn new(
        db: DbPool,
        ca: Arc<CaHolder>,
        public_host: String,
        api_port: u16,
        grpc_port: u16,
        agent_binary_path: String,
        encryption_key: Option<[u8; crypto::KEY_LENGTH]>,
    ) -> Self {
        Self {
            db,
            ca,
            public_host,
            api_port,
            grpc_port,
            agent_binary_path,
            encryption_key,
        }
    }

    /// Provision the host behind a server record. Every failure lands the
    /// server in `error` with the diagnostic in the audit trail.
    pub async fn provision(&self, server_id: &str, pool: &AgentPool) -> Result<()> {
        let server = self.server(server_id).await?;
        self.set_status(server_id, ServerStatus::Provisioning).await?;
        info!(server = %server.name, host = %server.host, "Provisioning server");

        match self.run(&server, pool).await {
            Ok(()) => {
                info!(server = %server.name, "Server provisioned and online");
                Ok(())
            }
            Err(e) => {
                let diagnostic = format!("{:#}", e);
                error!(server = %server.name, error = %diagnostic, "Provisioning failed");
                self.set_status(server_id, ServerStatus::Error).await?;
                self.audit(server_id, &diagnostic).await;
                Err(e)
            }
        }
    }

    async fn run(&self, server: &Server, pool: &AgentPool) -> Result<()> {
        // Trust-on-first-use host key handling before any SSH traffic.
        let scanned = scan_host_key(&server.host, server.ssh_port as u16).await?;
        match &server.ssh_host_key {
            Some(pinned) if pinned != &scanned => {
                bail!(
                    "SSH host key mismatch for {}: pinned {}, host presented {}",
                    server.host,
                    pinned,
                    scanned
                );
            }
            Some(_) => {}
            None => {
                sqlx::query("UPDATE servers SET ssh_host_key = ?, updated_at = ? WHERE id = ?")
                    .bind(&scanned)
                    .bind(now_rfc3339())
                    .bind(&server.id)
                    .execute(&self.db)
                    .await?;
            }
        }

        let session = self.dial(server).await?;

        run_remote(&session, &format!("sudo mkdir -p {} {}", REMOTE_CONFIG_DIR, REMOTE_DATA_DIR))
            .await
            .context("Failed to create remote directories")?;

        // Install the agent binary via a single-use download token.
        let token = self.mint_download_token().await?;
        let url = format!(
            "http://{}:{}/agent/download?token={}",
            self.public_host, self.api_port, token
        );
        run_remote(
            &session,
            &format!("sudo curl -fsSL '{}' -o {} && sudo chmod 0755 {}", url, REMOTE_BINARY, REMOTE_BINARY),
        )
        .await
        .context("Failed to install agent binary")?;

        // Drop trust material: root CA plus a leaf for this host.
        let leaf = self
            .ca
            .issue_agent_cert(&server.id, &server.host)
            .context("Failed to issue agent certificate")?;
        write_remote(&session, &format!("{}/ca.pem", REMOTE_CONFIG_DIR), &self.ca.cert_pem())
            .await?;
        write_remote(&session, &format!("{}/agent.pem", REMOTE_CONFIG_DIR), &leaf.cert_pem)
            .await?;
        write_remote(&session, &format!("{}/agent.key", REMOTE_CONFIG_DIR), &leaf.key_pem)
            .await?;
        run_remote(&session, &format!("sudo chmod 0600 {}/agent.key", REMOTE_CONFIG_DIR)).await?;

        // Systemd unit, enabled and started.
        write_remote(&session, UNIT_PATH, &systemd_unit(self.grpc_port)).await?;
        run_remote(
            &session,
            "sudo systemctl daemon-reload && sudo systemctl enable --now paasdeploy-agent",
        )
        .await
        .context("Failed to start agent service")?;

        if let Err(e) = session.close().await {
            warn!(error = %e, "SSH session close failed");
        }

        // Wait for the agent to come up on the control channel. The probe
        // records status=online plus version and heartbeat when it answers.
        let server = self.server(&server.id).await?;
        for attempt in 1..=READINESS_ATTEMPTS {
            tokio::time::sleep(READINESS_DELAY).await;
            match pool.probe(&server).await {
                Ok(info) => {
                    info!(
                        server = %server.name,
                        agent_version = %info.agent_version,
                        "Agent answered on control channel"
                    );
                    return Ok(());
                }
                Err(e) => {
                    if attempt == READINESS_ATTEMPTS {
                        return Err(e).context("Agent never became reachable");
                    }
                }
            }
        }
        unreachable!("readiness loop returns before exhausting attempts");
    }

    async fn dial(&self, server: &Server) -> Result<Session> {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(KnownHosts::Accept)
            .user(server.ssh_user.clone())
            .port(server.ssh_port as u16)
            .connect_timeout(Duration::from_secs(15));

        // Private key auth; the stored key may be encrypted at rest.
        let key_file = if let Some(ref encrypted) = server.ssh_key_encrypted {
            let key = crypto::decrypt_if_encrypted(encrypted, self.encryption_key.as_ref())
                .context("Failed to decrypt SSH key")?;
            let path = std::env::temp_dir().join(format!("paasdeploy-ssh-{}", new_id()));
            tokio::fs::write(&path, key).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = tokio::fs::metadata(&path).await?.permissions();
                perms.set_mode(0o600);
                tokio::fs::set_permissions(&path, perms).await?;
            }
            builder.keyfile(&path);
            Some(path)
        } else {
            None
        };

        let result = builder
            .connect(&server.host)
            .await
            .with_context(|| format!("Failed to connect to {}@{}", server.ssh_user, server.host));

        if let Some(path) = key_file {
            let _ = tokio::fs::remove_file(&path).await;
        }

        result
    }

    async fn mint_download_token(&self) -> Result<String> {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let expires_at = (chrono::Utc::now()
            + chrono::Duration::minutes(DOWNLOAD_TOKEN_TTL_MINUTES))
        .to_rfc3339();

        sqlx::query(
            "INSERT INTO agent_download_tokens (token, binary_path, expires_at, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&token)
        .bind(&self.agent_binary_path)
        .bind(&expires_at)
        .bind(now_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(token)
    }

    async fn server(&self, server_id: &str) -> Result<Server> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ?")
            .bind(server_id)
            .fetch_optional(&self.db)
            .await?
            .with_context(|| format!("server {} not found", server_id))
    }

    async fn set_status(&self, server_id: &str, status: ServerStatus) -> Result<()> {
        sqlx::query("UPDATE servers SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_rfc3339())
            .bind(server_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn audit(&self, server_id: &str, detail: &str) {
        let _ = sqlx::query(
            "INSERT INTO audit_logs (id, action, resource_type, resource_id, detail) \
             VALUES (?, 'provision_failed', 'server', ?, ?)",
        )
        .bind(new_id())
        .bind(server_id)
        .bind(detail)
        .execute(&self.db)
        .await;
    }
}

/// Scan a host's SSH key for pinning: `"<keytype> <base64>"` of the first
/// key the host offers.
async fn scan_host_key(host: &str, port: u16) -> Result<String> {
    let argv: Vec<String> = vec![
        "ssh-keyscan".into(),
        "-T".into(),
        "5".into(),
        "-p".into(),
        port.to_string(),
        host.into(),
    ];
    let out = exec::run(std::path::Path::new("."), Duration::from_secs(15), &argv)
        .await
        .context("ssh-keyscan failed")?;

    parse_keyscan(&out.stdout)
        .with_context(|| format!("No SSH host key scanned for {}", host))
}

fn parse_keyscan(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _host = parts.next()?;
            let keytype = parts.next()?;
            let key = parts.next()?;
            Some(format!("{} {}", keytype, key))
        })
        .next()
}

async fn run_remote(session: &Session, command: &str) -> Result<String> {
    let output = session
        .shell(command)
        .output()
        .await
        .with_context(|| format!("SSH command failed to run: {}", command))?;

    if !output.status.success() {
        bail!(
            "remote command `{}` exited with {:?}: {}",
            command,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Write a file on the host through sudo tee. Content is PEM or unit text,
/// which never contains a quoted heredoc terminator.
async fn write_remote(session: &Session, path: &str, content: &str) -> Result<()> {
    let command = format!(
        "sudo tee {} > /dev/null << 'PAASDEPLOY_EOF'\n{}\nPAASDEPLOY_EOF",
        path, content
    );
    run_remote(session, &command)
        .await
        .with_context(|| format!("Failed to write {}", path))?;
    Ok(())
}

fn systemd_unit(grpc_port: u16) -> String {
    format!(
        r#"[Unit]
Description=paasdeploy agent
After=network-online.target docker.service
Wants=network-online.target

[Service]
Environment=DEPLOY_DATA_DIR={data_dir}
ExecStart={binary} --port {port} --cert {config}/agent.pem --key {config}/agent.key --ca {config}/ca.pem
Restart=always
RestartSec=5

[Install]
WantedBy=multi-user.target
"#,
        data_dir = REMOTE_DATA_DIR,
        binary = REMOTE_BINARY,
        port = grpc_port,
        config = REMOTE_CONFIG_DIR,
    )
}
