//! DomainVerification entity: the single verification record of a domain

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::domain::VerificationMethod;

/// Status of the verification record
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    #[sea_orm(string_value = "pending")]
    Pending,

    #[sea_orm(string_value = "verified")]
    Verified,

    #[sea_orm(string_value = "failed")]
    Failed,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "domain_verifications")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "String(StringLen::N(36))")]
    pub id: String,

    /// Owning domain (one record per domain)
    #[sea_orm(column_type = "String(StringLen::N(36))", unique)]
    pub domain_id: String,

    pub method: VerificationMethod,

    /// Expected record value
    #[sea_orm(column_type = "Text")]
    pub challenge: String,

    pub status: VerificationStatus,

    pub last_checked_at: Option<ChronoDateTimeUtc>,

    pub attempts: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Record created through the DNS provider, removed when the domain is deleted
    pub provider_record_id: Option<String>,

    /// Manual DNS instructions shown when the provider could not create the record
    #[sea_orm(column_type = "Text", nullable)]
    pub instructions: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
