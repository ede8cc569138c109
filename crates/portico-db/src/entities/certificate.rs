//! Certificate entity: issued or uploaded TLS certificates with encrypted private keys

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// How the certificate was obtained
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum CertificateType {
    /// Issued by an ACME certificate authority
    #[sea_orm(string_value = "acme")]
    Acme,

    /// Supplied by an operator as a PEM pair
    #[sea_orm(string_value = "uploaded")]
    Uploaded,
}

/// Status of a certificate row
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    /// Issuance requested or being retried
    #[sea_orm(string_value = "pending")]
    Pending,

    /// Servable; at most one per domain
    #[sea_orm(string_value = "active")]
    Active,

    /// Past `not_after` or superseded by a newer certificate
    #[sea_orm(string_value = "expired")]
    Expired,

    /// Issuance gave up
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl CertificateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateStatus::Pending => "pending",
            CertificateStatus::Active => "active",
            CertificateStatus::Expired => "expired",
            CertificateStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "certificates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "String(StringLen::N(36))")]
    pub id: String,

    #[sea_orm(column_type = "String(StringLen::N(36))", indexed)]
    pub domain_id: String,

    /// Domain name the certificate was issued for
    pub domain: String,

    pub cert_type: CertificateType,

    pub issuer: Option<String>,

    pub not_before: Option<ChronoDateTimeUtc>,

    pub not_after: Option<ChronoDateTimeUtc>,

    pub status: CertificateStatus,

    /// Leaf certificate in PEM format
    #[sea_orm(column_type = "Text", nullable)]
    pub pem_cert: Option<String>,

    /// Intermediate chain in PEM format (may be empty)
    #[sea_orm(column_type = "Text", nullable)]
    pub pem_chain: Option<String>,

    /// AES-256-GCM sealed private key (base64); set together with `key_nonce`
    #[serde(skip_serializing)]
    #[sea_orm(column_type = "Text", nullable)]
    pub encrypted_key: Option<String>,

    /// Nonce used to seal `encrypted_key` (base64)
    #[serde(skip_serializing)]
    pub key_nonce: Option<String>,

    /// Renew through ACME before expiry (always true for `acme` rows)
    pub auto_renew: bool,

    /// Certificate this row replaces, if it is a renewal
    #[sea_orm(column_type = "String(StringLen::N(36))", nullable)]
    pub renewal_of: Option<String>,

    /// Issuance attempts so far
    pub attempts: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Earliest time the next issuance attempt may run
    pub next_attempt_at: Option<ChronoDateTimeUtc>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

impl Model {
    /// Whether both halves of the sealed key are present
    pub fn has_key(&self) -> bool {
        self.encrypted_key.is_some() && self.key_nonce.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
