//! Per-app environment variables.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EnvVar {
    pub id: String,
    pub app_id: String,
    pub key: String,
    pub value: String,
    pub is_secret: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Response DTO that never leaks secret values.
#[derive(Debug, Clone, Serialize)]
pub struct EnvVarResponse {
    pub id: String,
    pub key: String,
    pub value: String,
    pub is_secret: bool,
}

const MASK: &str = "********";

impl From<EnvVar> for EnvVarResponse {
    fn from(var: EnvVar) -> Self {
        let is_secret = var.is_secret != 0;
        Self {
            id: var.id,
            key: var.key,
            value: if is_secret {
                MASK.to_string()
            } else {
                var.value
            },
            is_secret,
        }
    }
}
