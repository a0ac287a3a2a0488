//! One-time agent download tokens.

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct AgentDownloadToken {
    pub token: String,
    pub binary_path: String,
    pub expires_at: String,
    pub consumed: i64,
    pub created_at: String,
}
