//! Route entity: exposes a service port on a domain path

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "routes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "String(StringLen::N(36))")]
    pub id: String,

    /// Service identifier owned by the container platform
    pub service_id: String,

    /// Domain the route is attached to; cleared when detached
    #[sea_orm(column_type = "String(StringLen::N(36))", nullable)]
    pub domain_id: Option<String>,

    /// Path prefix, always starting with `/`
    pub path: String,

    /// Container port the proxy forwards to
    pub port: i32,

    /// Serve over HTTPS (and redirect plain HTTP)
    pub tls: bool,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
