//! Application model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct App {
    pub id: String,
    pub user_id: String,
    /// DNS-safe name, unique among non-deleted apps.
    pub name: String,
    pub repository_url: String,
    pub branch: String,
    /// Subdirectory of the repository to build from; empty or "." means the
    /// repository root.
    pub workdir: String,
    /// Target host. None means the control-plane host itself.
    pub server_id: Option<String>,
    pub status: String,
    pub last_deployed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Active,
    Inactive,
    Deleted,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Active => "active",
            AppStatus::Inactive => "inactive",
            AppStatus::Deleted => "deleted",
        }
    }
}

impl App {
    /// Whether deploys run through the control channel rather than the
    /// local docker daemon.
    pub fn is_remote(&self) -> bool {
        self.server_id.is_some()
    }

    /// The directory inside the checkout that holds the app's sources.
    pub fn effective_workdir(&self) -> Option<&str> {
        match self.workdir.as_str() {
            "" | "." => None,
            other => Some(other),
        }
    }
}
