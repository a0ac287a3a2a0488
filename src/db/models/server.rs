//! Remote host model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub host: String,
    pub ssh_port: i64,
    pub ssh_user: String,
    #[serde(skip_serializing)]
    pub ssh_key_encrypted: Option<String>,
    #[serde(skip_serializing)]
    pub ssh_password_encrypted: Option<String>,
    /// Host key pinned on first connect; later dials must match it.
    pub ssh_host_key: Option<String>,
    pub status: String,
    pub agent_version: Option<String>,
    pub agent_update_mode: String,
    pub last_heartbeat_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Pending,
    Provisioning,
    Online,
    Offline,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Pending => "pending",
            ServerStatus::Provisioning => "provisioning",
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
            ServerStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentUpdateMode {
    Auto,
    Manual,
}

impl AgentUpdateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentUpdateMode::Auto => "auto",
            AgentUpdateMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => AgentUpdateMode::Manual,
            _ => AgentUpdateMode::Auto,
        }
    }
}

impl Server {
    pub fn update_mode(&self) -> AgentUpdateMode {
        AgentUpdateMode::parse(&self.agent_update_mode)
    }
}
