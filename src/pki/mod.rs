//! Root CA and leaf certificate issuance for the control channel.
//!
//! The root is generated once, persisted in the database and loaded on
//! every start. Leaves are issued on demand: one for the gRPC-facing side
//! of each agent, one for the server's client identity. All keys are
//! ECDSA P-256 generated per issue and never reused.

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use tracing::info;

use crate::db::{CertificateAuthorityRecord, DbPool};
use crate::utils::now_rfc3339;

const CA_COMMON_NAME: &str = "paasdeploy root ca";
const CA_VALIDITY_YEARS: i32 = 10;
const LEAF_VALIDITY_YEARS: i32 = 1;

#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

struct CaMaterial {
    cert_pem: String,
    key_pem: String,
}

/// Process-wide CA holder. Reads vastly outnumber writes (the root never
/// changes after load), hence the RW lock.
pub struct CaHolder {
    inner: RwLock<CaMaterial>,
}

/// Validity window anchored to today. The day is clamped so a leap-day
/// boot cannot produce an invalid future date.
fn set_validity(params: &mut CertificateParams, years: i32) {
    let now = Utc::now();
    let day = now.day().min(28) as u8;
    params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, day);
    params.not_after = rcgen::date_time_ymd(now.year() + years, now.month() as u8, day);
}

fn generate_root() -> Result<CaMaterial> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, CA_VALIDITY_YEARS);

    let key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let cert = params
        .self_signed(&key)
        .context("Failed to self-sign root certificate")?;

    Ok(CaMaterial {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

impl CaHolder {
    /// Load the persisted root, generating and storing a fresh one on first
    /// boot.
    pub async fn load_or_create(db: &DbPool) -> Result<Self> {
        let existing = sqlx::query_as::<_, CertificateAuthorityRecord>(
            "SELECT * FROM certificate_authority WHERE id = 1",
        )
        .fetch_optional(db)
        .await?;

        let material = match existing {
            Some(record) => {
                info!("Loaded root CA from database");
                CaMaterial {
                    cert_pem: record.cert_pem,
                    key_pem: record.key_pem,
                }
            }
            None => {
                info!("No root CA found, generating one");
                let material = generate_root()?;
                sqlx::query(
                    "INSERT INTO certificate_authority (id, cert_pem, key_pem, created_at) \
                     VALUES (1, ?, ?, ?)",
                )
                .bind(&material.cert_pem)
                .bind(&material.key_pem)
                .bind(now_rfc3339())
                .execute(db)
                .await?;
                material
            }
        };

        Ok(Self {
            inner: RwLock::new(material),
        })
    }

    /// In-memory holder for tests and the agent side (which only trusts,
    /// never signs).
    pub fn from_material(cert_pem: String, key_pem: String) -> Self {
        Self {
            inner: RwLock::new(CaMaterial { cert_pem, key_pem }),
        }
    }

    pub fn cert_pem(&self) -> String {
        self.inner.read().cert_pem.clone()
    }

    /// Leaf for the control plane's gRPC client identity and for local
    /// listeners: SAN covers the public host plus loopback.
    pub fn issue_server_cert(&self, public_host: &str) -> Result<IssuedCert> {
        let sans = vec![
            public_host.to_string(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ];
        self.issue(public_host, sans)
    }

    /// Leaf for a provisioned agent: SAN is the host the server dials,
    /// CN is the server record id.
    pub fn issue_agent_cert(&self, server_id: &str, host: &str) -> Result<IssuedCert> {
        self.issue(server_id, vec![host.to_string()])
    }

    fn issue(&self, common_name: &str, sans: Vec<String>) -> Result<IssuedCert> {
        let material = self.inner.read();

        let ca_key = KeyPair::from_pem(&material.key_pem).context("Failed to parse CA key")?;
        let ca_params = CertificateParams::from_ca_cert_pem(&material.cert_pem)
            .context("Failed to parse CA certificate")?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .context("Failed to reconstruct CA signer")?;

        let mut params =
            CertificateParams::new(sans).context("Invalid subject alternative names")?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        set_validity(&mut params, LEAF_VALIDITY_YEARS);

        let key = KeyPair::generate().context("Failed to generate leaf key pair")?;
        let cert = params
            .signed_by(&key, &ca_cert, &ca_key)
            .context("Failed to sign leaf certificate")?;

        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}
