//! Custom domain bindings published to the edge proxy via container labels.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CustomDomain {
    pub id: String,
    pub app_id: String,
    pub domain: String,
    pub path_prefix: String,
    pub created_at: String,
}
