//! DNS provider store

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use super::StoreError;
use crate::entities::dns_provider::{self, DnsProviderKind};
use crate::entities::domain;

/// Input for [`DnsProviderStore::create`]; the token is already sealed
#[derive(Debug, Clone)]
pub struct NewDnsProvider {
    pub name: String,
    pub kind: DnsProviderKind,
    pub encrypted_api_token: Option<String>,
    pub token_nonce: Option<String>,
}

#[derive(Clone)]
pub struct DnsProviderStore {
    db: DatabaseConnection,
}

impl DnsProviderStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewDnsProvider) -> Result<dns_provider::Model, StoreError> {
        let now = Utc::now();
        let name = new.name.clone();

        dns_provider::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            name: Set(new.name),
            kind: Set(new.kind),
            encrypted_api_token: Set(new.encrypted_api_token),
            token_nonce: Set(new.token_nonce),
            active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
        .map_err(|e| StoreError::from_insert(e, || format!("DNS provider {name} already exists")))
    }

    pub async fn get(&self, id: &str) -> Result<dns_provider::Model, StoreError> {
        dns_provider::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::not_found("dns provider", id))
    }

    pub async fn list(&self) -> Result<Vec<dns_provider::Model>, StoreError> {
        Ok(dns_provider::Entity::find()
            .order_by_asc(dns_provider::Column::Name)
            .all(&self.db)
            .await?)
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<(), StoreError> {
        let res = dns_provider::Entity::update_many()
            .col_expr(dns_provider::Column::Active, Expr::value(active))
            .col_expr(dns_provider::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(dns_provider::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        if res.rows_affected == 0 {
            return Err(StoreError::not_found("dns provider", id));
        }
        Ok(())
    }

    /// Delete a provider no domain refers to
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let provider = self.get(id).await?;

        let in_use = domain::Entity::find()
            .filter(domain::Column::ProviderId.eq(id))
            .one(&self.db)
            .await?;
        if let Some(domain_model) = in_use {
            return Err(StoreError::Conflict(format!(
                "DNS provider {} is used by {}",
                provider.name, domain_model.name
            )));
        }

        dns_provider::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
