//! Persisted root certificate authority (singleton row).

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct CertificateAuthorityRecord {
    pub id: i64,
    pub cert_pem: String,
    pub key_pem: String,
    pub created_at: String,
}
