//! Route store

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use uuid::Uuid;

use super::{ChangeSignal, StoreError};
use crate::entities::domain::{self, DomainStatus};
use crate::entities::route;

/// Input for [`RouteStore::attach`]
#[derive(Debug, Clone)]
pub struct NewRoute {
    pub service_id: String,
    pub domain_id: String,
    pub path: String,
    pub port: i32,
    pub tls: bool,
}

#[derive(Clone)]
pub struct RouteStore {
    db: DatabaseConnection,
    signal: ChangeSignal,
}

impl RouteStore {
    pub fn new(db: DatabaseConnection, signal: ChangeSignal) -> Self {
        Self { db, signal }
    }

    /// Attach a service to an `active` domain.
    ///
    /// The status check and the insert share a transaction so a domain that
    /// falls back from `active` concurrently cannot gain a route.
    pub async fn attach(&self, new: NewRoute) -> Result<route::Model, StoreError> {
        let txn = self.db.begin().await?;

        let domain_model = domain::Entity::find_by_id(new.domain_id.clone())
            .one(&txn)
            .await?
            .ok_or_else(|| StoreError::not_found("domain", new.domain_id.as_str()))?;
        if domain_model.status != DomainStatus::Active {
            return Err(StoreError::InvalidTransition {
                entity: "domain",
                id: domain_model.id,
                to: "route attachment",
                reason: format!(
                    "{} is {}, routes need an active domain",
                    domain_model.name,
                    domain_model.status.as_str()
                ),
            });
        }

        let path = new.path.clone();
        let model = route::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            service_id: Set(new.service_id),
            domain_id: Set(Some(new.domain_id)),
            path: Set(new.path),
            port: Set(new.port),
            tls: Set(new.tls),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            StoreError::from_insert(e, || {
                format!("{} already routes {}", domain_model.name, path)
            })
        })?;

        txn.commit().await?;

        self.signal.notify();
        Ok(model)
    }

    pub async fn get(&self, id: &str) -> Result<route::Model, StoreError> {
        route::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::not_found("route", id))
    }

    pub async fn list(&self) -> Result<Vec<route::Model>, StoreError> {
        Ok(route::Entity::find()
            .order_by_asc(route::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn list_for_domain(&self, domain_id: &str) -> Result<Vec<route::Model>, StoreError> {
        Ok(route::Entity::find()
            .filter(route::Column::DomainId.eq(domain_id))
            .order_by_asc(route::Column::Path)
            .all(&self.db)
            .await?)
    }

    /// Routes currently attached to a domain
    pub async fn list_attached(&self) -> Result<Vec<route::Model>, StoreError> {
        Ok(route::Entity::find()
            .filter(route::Column::DomainId.is_not_null())
            .all(&self.db)
            .await?)
    }

    /// Remove a route
    pub async fn detach(&self, id: &str) -> Result<route::Model, StoreError> {
        let model = self.get(id).await?;
        route::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        self.signal.notify();
        Ok(model)
    }
}
