//! Domain store

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use super::{ChangeSignal, StoreError};
use crate::entities::domain::{self, DomainStatus, VerificationMethod};
use crate::entities::{certificate, domain_verification, route};
use crate::entities::domain_verification::VerificationStatus;

/// Input for [`DomainStore::create`]
#[derive(Debug, Clone)]
pub struct NewDomain {
    pub name: String,
    pub verification_method: VerificationMethod,
    pub provider_id: Option<String>,
    pub zone_id: Option<String>,
    pub auto_manage: bool,
    pub verification_token: String,
    /// Expected record value stored on the verification record
    pub challenge: String,
}

/// Result of recording a failed verification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Still `verifying`; the next check is scheduled
    Retry { failures: i32 },
    /// Gave up; the domain is now `error`
    GaveUp { failures: i32 },
    /// The domain was no longer checkable (deleted, reset or already verified)
    Skipped,
}

#[derive(Clone)]
pub struct DomainStore {
    db: DatabaseConnection,
    signal: ChangeSignal,
}

impl DomainStore {
    pub fn new(db: DatabaseConnection, signal: ChangeSignal) -> Self {
        Self { db, signal }
    }

    /// Create a domain in `pending` together with its verification record
    pub async fn create(&self, new: NewDomain) -> Result<domain::Model, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let txn = self.db.begin().await?;

        let model = domain::ActiveModel {
            id: Set(id.clone()),
            name: Set(new.name.clone()),
            status: Set(DomainStatus::Pending),
            verification_method: Set(new.verification_method),
            provider_id: Set(new.provider_id),
            zone_id: Set(new.zone_id),
            verification_token: Set(new.verification_token),
            verification_checked_at: Set(None),
            certificate_id: Set(None),
            auto_manage: Set(new.auto_manage),
            error_reason: Set(None),
            consecutive_failures: Set(0),
            next_check_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            StoreError::from_insert(e, || format!("domain {} already exists", new.name))
        })?;

        domain_verification::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            domain_id: Set(id),
            method: Set(new.verification_method),
            challenge: Set(new.challenge),
            status: Set(VerificationStatus::Pending),
            last_checked_at: Set(None),
            attempts: Set(0),
            last_error: Set(None),
            provider_record_id: Set(None),
            instructions: Set(None),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        debug!(domain = %model.name, domain_id = %model.id, "Domain created");
        self.signal.notify();
        Ok(model)
    }

    pub async fn find(&self, id: &str) -> Result<Option<domain::Model>, StoreError> {
        Ok(domain::Entity::find_by_id(id.to_string()).one(&self.db).await?)
    }

    pub async fn get(&self, id: &str) -> Result<domain::Model, StoreError> {
        self.find(id)
            .await?
            .ok_or_else(|| StoreError::not_found("domain", id))
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<domain::Model>, StoreError> {
        Ok(domain::Entity::find()
            .filter(domain::Column::Name.eq(name))
            .one(&self.db)
            .await?)
    }

    /// All domains ordered by name
    pub async fn list(&self) -> Result<Vec<domain::Model>, StoreError> {
        Ok(domain::Entity::find()
            .order_by_asc(domain::Column::Name)
            .all(&self.db)
            .await?)
    }

    pub async fn list_by_status(
        &self,
        statuses: &[DomainStatus],
    ) -> Result<Vec<domain::Model>, StoreError> {
        Ok(domain::Entity::find()
            .filter(domain::Column::Status.is_in(statuses.iter().copied()))
            .order_by_asc(domain::Column::Name)
            .all(&self.db)
            .await?)
    }

    /// `pending`/`verifying` domains whose next check is due
    pub async fn due_for_verification(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<domain::Model>, StoreError> {
        Ok(domain::Entity::find()
            .filter(
                domain::Column::Status.is_in([DomainStatus::Pending, DomainStatus::Verifying]),
            )
            .filter(
                domain::Column::NextCheckAt
                    .is_null()
                    .or(domain::Column::NextCheckAt.lte(now)),
            )
            .order_by_asc(domain::Column::Name)
            .all(&self.db)
            .await?)
    }

    /// Conditionally move a domain from one of `from` to `to`.
    ///
    /// Returns `false` when the domain was not in any of the `from` states.
    /// `active` requires a certificate reference and is refused otherwise.
    pub async fn transition(
        &self,
        id: &str,
        from: &[DomainStatus],
        to: DomainStatus,
    ) -> Result<bool, StoreError> {
        let mut update = domain::Entity::update_many()
            .col_expr(domain::Column::Status, Expr::value(to))
            .col_expr(domain::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(domain::Column::Id.eq(id))
            .filter(domain::Column::Status.is_in(from.iter().copied()));

        if to == DomainStatus::Active {
            update = update.filter(domain::Column::CertificateId.is_not_null());
        }

        let res = update.exec(&self.db).await?;
        let moved = res.rows_affected == 1;
        if moved {
            debug!(domain_id = %id, to = to.as_str(), "Domain status changed");
            self.signal.notify();
        }
        Ok(moved)
    }

    /// Record a matching DNS check.
    ///
    /// Moves `pending|verifying` to `verified`, or straight to `active` when the
    /// domain already holds an active certificate. Returns the new status, or
    /// `None` when the domain was not checkable anymore.
    pub async fn mark_verified(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DomainStatus>, StoreError> {
        let txn = self.db.begin().await?;

        let Some(current) = domain::Entity::find_by_id(id.to_string()).one(&txn).await? else {
            return Ok(None);
        };
        if !matches!(
            current.status,
            DomainStatus::Pending | DomainStatus::Verifying
        ) {
            return Ok(None);
        }

        let holds_active_cert = match &current.certificate_id {
            Some(cert_id) => certificate::Entity::find_by_id(cert_id.clone())
                .one(&txn)
                .await?
                .is_some_and(|c| c.status == certificate::CertificateStatus::Active),
            None => false,
        };
        let to = if holds_active_cert {
            DomainStatus::Active
        } else {
            DomainStatus::Verified
        };

        let res = domain::Entity::update_many()
            .col_expr(domain::Column::Status, Expr::value(to))
            .col_expr(domain::Column::VerificationCheckedAt, Expr::value(now))
            .col_expr(domain::Column::ConsecutiveFailures, Expr::value(0))
            .col_expr(domain::Column::NextCheckAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(domain::Column::ErrorReason, Expr::value(Option::<String>::None))
            .col_expr(domain::Column::UpdatedAt, Expr::value(now))
            .filter(domain::Column::Id.eq(id))
            .filter(domain::Column::Status.is_in([DomainStatus::Pending, DomainStatus::Verifying]))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        if res.rows_affected == 1 {
            self.signal.notify();
            Ok(Some(to))
        } else {
            Ok(None)
        }
    }

    /// Record a failed or non-matching DNS check.
    ///
    /// Increments the failure counter; once it reaches `max_failures` the domain
    /// moves to `error` with `reason`, otherwise to `verifying` with the next
    /// check at `next_check_at`.
    pub async fn record_verification_failure(
        &self,
        id: &str,
        now: DateTime<Utc>,
        reason: &str,
        next_check_at: DateTime<Utc>,
        max_failures: u32,
    ) -> Result<VerificationOutcome, StoreError> {
        let txn = self.db.begin().await?;

        let Some(current) = domain::Entity::find_by_id(id.to_string()).one(&txn).await? else {
            return Ok(VerificationOutcome::Skipped);
        };
        if !matches!(
            current.status,
            DomainStatus::Pending | DomainStatus::Verifying
        ) {
            return Ok(VerificationOutcome::Skipped);
        }

        let failures = current.consecutive_failures.saturating_add(1);
        let gave_up = failures as u32 >= max_failures;

        let mut update = domain::Entity::update_many()
            .col_expr(domain::Column::ConsecutiveFailures, Expr::value(failures))
            .col_expr(domain::Column::VerificationCheckedAt, Expr::value(now))
            .col_expr(domain::Column::UpdatedAt, Expr::value(now));
        update = if gave_up {
            update
                .col_expr(domain::Column::Status, Expr::value(DomainStatus::Error))
                .col_expr(domain::Column::ErrorReason, Expr::value(reason.to_string()))
                .col_expr(domain::Column::NextCheckAt, Expr::value(Option::<DateTime<Utc>>::None))
        } else {
            update
                .col_expr(domain::Column::Status, Expr::value(DomainStatus::Verifying))
                .col_expr(domain::Column::NextCheckAt, Expr::value(next_check_at))
        };

        update
            .filter(domain::Column::Id.eq(id))
            .filter(domain::Column::Status.is_in([DomainStatus::Pending, DomainStatus::Verifying]))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        if gave_up {
            self.signal.notify();
            Ok(VerificationOutcome::GaveUp { failures })
        } else {
            Ok(VerificationOutcome::Retry { failures })
        }
    }

    /// Operator reset of an errored domain back to `pending`
    pub async fn reset(&self, id: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let res = domain::Entity::update_many()
            .col_expr(domain::Column::Status, Expr::value(DomainStatus::Pending))
            .col_expr(domain::Column::ConsecutiveFailures, Expr::value(0))
            .col_expr(domain::Column::ErrorReason, Expr::value(Option::<String>::None))
            .col_expr(domain::Column::NextCheckAt, Expr::value(Option::<DateTime<Utc>>::None))
            .col_expr(domain::Column::UpdatedAt, Expr::value(now))
            .filter(domain::Column::Id.eq(id))
            .filter(domain::Column::Status.eq(DomainStatus::Error))
            .exec(&txn)
            .await?;

        if res.rows_affected == 1 {
            domain_verification::Entity::update_many()
                .col_expr(
                    domain_verification::Column::Status,
                    Expr::value(VerificationStatus::Pending),
                )
                .col_expr(domain_verification::Column::Attempts, Expr::value(0))
                .col_expr(
                    domain_verification::Column::LastError,
                    Expr::value(Option::<String>::None),
                )
                .filter(domain_verification::Column::DomainId.eq(id))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        let reset = res.rows_affected == 1;
        if reset {
            self.signal.notify();
        }
        Ok(reset)
    }

    /// Push the next verification check out to `at` (manual trigger uses `now`)
    pub async fn schedule_check(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        domain::Entity::update_many()
            .col_expr(domain::Column::NextCheckAt, Expr::value(at))
            .filter(domain::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Delete a domain with its verification record, certificates and routes
    /// in one transaction.
    pub async fn delete(&self, id: &str) -> Result<domain::Model, StoreError> {
        let txn = self.db.begin().await?;

        let model = domain::Entity::find_by_id(id.to_string())
            .one(&txn)
            .await?
            .ok_or_else(|| StoreError::not_found("domain", id))?;

        route::Entity::delete_many()
            .filter(route::Column::DomainId.eq(id))
            .exec(&txn)
            .await?;
        certificate::Entity::delete_many()
            .filter(certificate::Column::DomainId.eq(id))
            .exec(&txn)
            .await?;
        domain_verification::Entity::delete_many()
            .filter(domain_verification::Column::DomainId.eq(id))
            .exec(&txn)
            .await?;
        domain::Entity::delete_by_id(id.to_string())
            .exec(&txn)
            .await?;

        txn.commit().await?;

        debug!(domain = %model.name, "Domain deleted");
        self.signal.notify();
        Ok(model)
    }
}
