//! Domain verification record store

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};

use super::StoreError;
use crate::entities::domain_verification::{self, VerificationStatus};

#[derive(Clone)]
pub struct VerificationStore {
    db: DatabaseConnection,
}

impl VerificationStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get_by_domain(
        &self,
        domain_id: &str,
    ) -> Result<domain_verification::Model, StoreError> {
        domain_verification::Entity::find()
            .filter(domain_verification::Column::DomainId.eq(domain_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::not_found("verification", domain_id))
    }

    /// Record the outcome of one DNS check; always stamps `last_checked_at`
    pub async fn record_check(
        &self,
        domain_id: &str,
        status: VerificationStatus,
        checked_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        domain_verification::Entity::update_many()
            .col_expr(domain_verification::Column::Status, Expr::value(status))
            .col_expr(
                domain_verification::Column::LastCheckedAt,
                Expr::value(checked_at),
            )
            .col_expr(
                domain_verification::Column::Attempts,
                Expr::col(domain_verification::Column::Attempts).add(1),
            )
            .col_expr(domain_verification::Column::LastError, Expr::value(error))
            .filter(domain_verification::Column::DomainId.eq(domain_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Remember the provider-created record, or the manual instructions when the provider failed
    pub async fn set_provisioning(
        &self,
        domain_id: &str,
        provider_record_id: Option<String>,
        instructions: Option<String>,
    ) -> Result<(), StoreError> {
        domain_verification::Entity::update_many()
            .col_expr(
                domain_verification::Column::ProviderRecordId,
                Expr::value(provider_record_id),
            )
            .col_expr(
                domain_verification::Column::Instructions,
                Expr::value(instructions),
            )
            .filter(domain_verification::Column::DomainId.eq(domain_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
