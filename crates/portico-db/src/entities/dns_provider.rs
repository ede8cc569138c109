//! DnsProvider entity: credentials for an API-managed DNS service

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Supported DNS provider backends
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    #[sea_orm(string_value = "cloudflare")]
    Cloudflare,

    #[sea_orm(string_value = "hetzner")]
    Hetzner,

    /// No API; records are created by hand from surfaced instructions
    #[sea_orm(string_value = "manual")]
    Manual,
}

impl DnsProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsProviderKind::Cloudflare => "cloudflare",
            DnsProviderKind::Hetzner => "hetzner",
            DnsProviderKind::Manual => "manual",
        }
    }

    /// Whether this backend needs an API token
    pub fn requires_token(&self) -> bool {
        !matches!(self, DnsProviderKind::Manual)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "dns_providers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "String(StringLen::N(36))")]
    pub id: String,

    #[sea_orm(unique)]
    pub name: String,

    pub kind: DnsProviderKind,

    /// Sealed API token (base64); set together with `token_nonce`
    #[serde(skip_serializing)]
    #[sea_orm(column_type = "Text", nullable)]
    pub encrypted_api_token: Option<String>,

    #[serde(skip_serializing)]
    pub token_nonce: Option<String>,

    pub active: bool,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
