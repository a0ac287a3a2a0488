//! Deployment model: one build+release attempt for an app.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Deployment {
    pub id: String,
    pub app_id: String,
    pub commit_sha: String,
    pub commit_message: String,
    pub status: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub error_message: Option<String>,
    /// Append-only build/release log.
    pub logs: String,
    pub previous_image_tag: Option<String>,
    pub current_image_tag: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeploymentStatus::Pending),
            "running" => Some(DeploymentStatus::Running),
            "success" => Some(DeploymentStatus::Success),
            "failed" => Some(DeploymentStatus::Failed),
            "cancelled" => Some(DeploymentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Success | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

impl Deployment {
    pub fn parsed_status(&self) -> Option<DeploymentStatus> {
        DeploymentStatus::parse(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in ["pending", "running", "success", "failed", "cancelled"] {
            assert_eq!(DeploymentStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(DeploymentStatus::parse("replaced").is_none());
    }

    #[test]
    fn test_terminality() {
        assert!(!DeploymentStatus::Pending.is_terminal());
        assert!(!DeploymentStatus::Running.is_terminal());
        assert!(DeploymentStatus::Success.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::Cancelled.is_terminal());
    }
}
