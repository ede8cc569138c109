//! Domain entity: a custom hostname moving through verification and certificate provisioning

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a custom domain
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    /// Created by an operator, no verification attempt yet
    #[sea_orm(string_value = "pending")]
    Pending,

    /// At least one verification attempt did not match yet
    #[sea_orm(string_value = "verifying")]
    Verifying,

    /// DNS control proven, waiting for an active certificate
    #[sea_orm(string_value = "verified")]
    Verified,

    /// Verified and serving with an active certificate
    #[sea_orm(string_value = "active")]
    Active,

    /// Verification gave up; requires an explicit operator reset
    #[sea_orm(string_value = "error")]
    Error,
}

impl DomainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainStatus::Pending => "pending",
            DomainStatus::Verifying => "verifying",
            DomainStatus::Verified => "verified",
            DomainStatus::Active => "active",
            DomainStatus::Error => "error",
        }
    }
}

/// DNS record type used to prove control of a domain
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
#[serde(rename_all = "UPPERCASE")]
pub enum VerificationMethod {
    #[sea_orm(string_value = "A")]
    A,

    #[sea_orm(string_value = "CNAME")]
    Cname,

    #[sea_orm(string_value = "TXT")]
    Txt,
}

impl VerificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMethod::A => "A",
            VerificationMethod::Cname => "CNAME",
            VerificationMethod::Txt => "TXT",
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "domains")]
pub struct Model {
    /// Domain ID (UUID)
    #[sea_orm(primary_key, auto_increment = false, column_type = "String(StringLen::N(36))")]
    pub id: String,

    /// Fully qualified hostname, lowercase, globally unique
    #[sea_orm(unique)]
    pub name: String,

    pub status: DomainStatus,

    /// Record type checked by the verification engine
    pub verification_method: VerificationMethod,

    /// DNS provider used when `auto_manage` is set
    #[sea_orm(column_type = "String(StringLen::N(36))", nullable)]
    pub provider_id: Option<String>,

    /// Provider-side zone identifier
    pub zone_id: Option<String>,

    /// Random token generated at creation time
    pub verification_token: String,

    pub verification_checked_at: Option<ChronoDateTimeUtc>,

    /// Currently served certificate; only ever points at an `active` row
    #[sea_orm(column_type = "String(StringLen::N(36))", nullable)]
    pub certificate_id: Option<String>,

    /// Whether DNS records are managed through `provider_id`
    pub auto_manage: bool,

    /// Reason recorded when the domain moved to `error`
    #[sea_orm(column_type = "Text", nullable)]
    pub error_reason: Option<String>,

    /// Consecutive failed verification attempts
    pub consecutive_failures: i32,

    /// Earliest time the scheduler should check this domain again
    pub next_check_at: Option<ChronoDateTimeUtc>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
