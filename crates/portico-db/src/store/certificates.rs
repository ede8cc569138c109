//! Certificate store
//!
//! A domain has at most one `active` certificate. Replacements are new rows;
//! the switch to a new certificate (cutover) happens in one transaction that
//! activates the new row, expires the previous one and repoints the domain.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChangeSignal, StoreError};
use crate::entities::certificate::{self, CertificateStatus, CertificateType};
use crate::entities::domain::{self, DomainStatus};

/// Material returned by a certificate authority for a pending row
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub issuer: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub pem_cert: String,
    pub pem_chain: String,
    pub encrypted_key: String,
    pub key_nonce: String,
}

/// A validated, operator-supplied certificate
#[derive(Debug, Clone)]
pub struct UploadedCertificate {
    pub domain_id: String,
    pub domain: String,
    pub issued: IssuedCertificate,
    pub auto_renew: bool,
}

#[derive(Clone)]
pub struct CertificateStore {
    db: DatabaseConnection,
    signal: ChangeSignal,
}

impl CertificateStore {
    pub fn new(db: DatabaseConnection, signal: ChangeSignal) -> Self {
        Self { db, signal }
    }

    pub async fn find(&self, id: &str) -> Result<Option<certificate::Model>, StoreError> {
        Ok(certificate::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?)
    }

    pub async fn get(&self, id: &str) -> Result<certificate::Model, StoreError> {
        self.find(id)
            .await?
            .ok_or_else(|| StoreError::not_found("certificate", id))
    }

    /// All certificates, newest first
    pub async fn list(&self) -> Result<Vec<certificate::Model>, StoreError> {
        Ok(certificate::Entity::find()
            .order_by_desc(certificate::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn list_for_domain(
        &self,
        domain_id: &str,
    ) -> Result<Vec<certificate::Model>, StoreError> {
        Ok(certificate::Entity::find()
            .filter(certificate::Column::DomainId.eq(domain_id))
            .order_by_desc(certificate::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn list_active(&self) -> Result<Vec<certificate::Model>, StoreError> {
        Ok(certificate::Entity::find()
            .filter(certificate::Column::Status.eq(CertificateStatus::Active))
            .all(&self.db)
            .await?)
    }

    pub async fn pending_for_domain(
        &self,
        domain_id: &str,
    ) -> Result<Option<certificate::Model>, StoreError> {
        Ok(certificate::Entity::find()
            .filter(certificate::Column::DomainId.eq(domain_id))
            .filter(certificate::Column::Status.eq(CertificateStatus::Pending))
            .one(&self.db)
            .await?)
    }

    /// Create a `pending` ACME certificate row for `domain`.
    ///
    /// At most one pending row exists per domain; a second request is a conflict.
    pub async fn create_pending(
        &self,
        domain: &domain::Model,
        renewal_of: Option<String>,
    ) -> Result<certificate::Model, StoreError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let existing = certificate::Entity::find()
            .filter(certificate::Column::DomainId.eq(domain.id.as_str()))
            .filter(certificate::Column::Status.eq(CertificateStatus::Pending))
            .one(&txn)
            .await?;
        if existing.is_some() {
            return Err(StoreError::Conflict(format!(
                "certificate issuance already pending for {}",
                domain.name
            )));
        }

        let model = certificate::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            domain_id: Set(domain.id.clone()),
            domain: Set(domain.name.clone()),
            cert_type: Set(CertificateType::Acme),
            issuer: Set(None),
            not_before: Set(None),
            not_after: Set(None),
            status: Set(CertificateStatus::Pending),
            pem_cert: Set(None),
            pem_chain: Set(None),
            encrypted_key: Set(None),
            key_nonce: Set(None),
            auto_renew: Set(true),
            renewal_of: Set(renewal_of),
            attempts: Set(0),
            last_error: Set(None),
            next_attempt_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        debug!(domain = %domain.name, certificate_id = %model.id, renewal = model.renewal_of.is_some(), "Certificate requested");
        Ok(model)
    }

    /// Store an uploaded certificate as `active` and cut the domain over to it
    pub async fn create_uploaded(
        &self,
        upload: UploadedCertificate,
    ) -> Result<certificate::Model, StoreError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let domain_model = domain::Entity::find_by_id(upload.domain_id.clone())
            .one(&txn)
            .await?
            .ok_or_else(|| StoreError::not_found("domain", upload.domain_id.as_str()))?;

        let issued = upload.issued;
        let model = certificate::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            domain_id: Set(domain_model.id.clone()),
            domain: Set(upload.domain),
            cert_type: Set(CertificateType::Uploaded),
            issuer: Set(issued.issuer),
            not_before: Set(Some(issued.not_before)),
            not_after: Set(Some(issued.not_after)),
            status: Set(CertificateStatus::Active),
            pem_cert: Set(Some(issued.pem_cert)),
            pem_chain: Set(Some(issued.pem_chain)),
            encrypted_key: Set(Some(issued.encrypted_key)),
            key_nonce: Set(Some(issued.key_nonce)),
            auto_renew: Set(upload.auto_renew),
            renewal_of: Set(domain_model.certificate_id.clone()),
            attempts: Set(0),
            last_error: Set(None),
            next_attempt_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        cutover(&txn, &model, now).await?;
        txn.commit().await?;

        info!(domain = %model.domain, certificate_id = %model.id, "Uploaded certificate activated");
        self.signal.notify();
        Ok(model)
    }

    /// Fill a `pending` row with issued material, activate it and cut over
    pub async fn complete(
        &self,
        id: &str,
        issued: IssuedCertificate,
    ) -> Result<certificate::Model, StoreError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let current = certificate::Entity::find_by_id(id.to_string())
            .one(&txn)
            .await?
            .ok_or_else(|| StoreError::not_found("certificate", id))?;
        if current.status != CertificateStatus::Pending {
            return Err(StoreError::InvalidTransition {
                entity: "certificate",
                id: id.to_string(),
                to: CertificateStatus::Active.as_str(),
                reason: format!("status is {}", current.status.as_str()),
            });
        }
        if domain::Entity::find_by_id(current.domain_id.clone())
            .one(&txn)
            .await?
            .is_none()
        {
            return Err(StoreError::not_found("domain", current.domain_id));
        }

        let mut active = current.into_active_model();
        active.issuer = Set(issued.issuer);
        active.not_before = Set(Some(issued.not_before));
        active.not_after = Set(Some(issued.not_after));
        active.status = Set(CertificateStatus::Active);
        active.pem_cert = Set(Some(issued.pem_cert));
        active.pem_chain = Set(Some(issued.pem_chain));
        active.encrypted_key = Set(Some(issued.encrypted_key));
        active.key_nonce = Set(Some(issued.key_nonce));
        active.last_error = Set(None);
        active.next_attempt_at = Set(None);
        active.updated_at = Set(now);
        let model = active.update(&txn).await?;

        cutover(&txn, &model, now).await?;
        txn.commit().await?;

        info!(domain = %model.domain, certificate_id = %model.id, not_after = ?model.not_after, "Certificate activated");
        self.signal.notify();
        Ok(model)
    }

    /// Record a failed issuance attempt.
    ///
    /// With `next_attempt_at` the row stays `pending` for a retry; without it
    /// the row becomes `failed`.
    pub async fn record_failure(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<certificate::Model, StoreError> {
        let current = self.get(id).await?;
        if current.status != CertificateStatus::Pending {
            return Err(StoreError::InvalidTransition {
                entity: "certificate",
                id: id.to_string(),
                to: CertificateStatus::Failed.as_str(),
                reason: format!("status is {}", current.status.as_str()),
            });
        }

        let attempts = current.attempts.saturating_add(1);
        let mut active = current.into_active_model();
        active.attempts = Set(attempts);
        active.last_error = Set(Some(error.to_string()));
        active.next_attempt_at = Set(next_attempt_at);
        if next_attempt_at.is_none() {
            active.status = Set(CertificateStatus::Failed);
        }
        active.updated_at = Set(Utc::now());
        Ok(active.update(&self.db).await?)
    }

    /// Pending rows whose next attempt is due
    pub async fn due_for_issuance(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<certificate::Model>, StoreError> {
        Ok(certificate::Entity::find()
            .filter(certificate::Column::Status.eq(CertificateStatus::Pending))
            .filter(
                certificate::Column::NextAttemptAt
                    .is_null()
                    .or(certificate::Column::NextAttemptAt.lte(now)),
            )
            .order_by_asc(certificate::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// Active certificates expiring within `window` that should be renewed
    /// and have no renewal in flight yet
    pub async fn due_for_renewal(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<certificate::Model>, StoreError> {
        let candidates = certificate::Entity::find()
            .filter(certificate::Column::Status.eq(CertificateStatus::Active))
            .filter(certificate::Column::NotAfter.lte(now + window))
            .filter(certificate::Column::NotAfter.gt(now))
            .filter(
                certificate::Column::CertType
                    .eq(CertificateType::Acme)
                    .or(certificate::Column::AutoRenew.eq(true)),
            )
            .order_by_asc(certificate::Column::NotAfter)
            .all(&self.db)
            .await?;

        let in_flight = certificate::Entity::find()
            .filter(
                certificate::Column::Status
                    .is_in([CertificateStatus::Pending, CertificateStatus::Failed]),
            )
            .all(&self.db)
            .await?;
        let pending_domains: HashSet<String> = in_flight
            .iter()
            .filter(|c| c.status == CertificateStatus::Pending)
            .map(|c| c.domain_id.clone())
            .collect();
        // A renewal that already failed is not retried by the sweep
        let attempted: HashSet<String> = in_flight
            .into_iter()
            .filter_map(|c| c.renewal_of)
            .collect();

        Ok(candidates
            .into_iter()
            .filter(|c| !pending_domains.contains(&c.domain_id) && !attempted.contains(&c.id))
            .collect())
    }

    /// Expire active certificates whose `not_after` has passed.
    ///
    /// A domain serving an expired certificate loses its reference and drops
    /// from `active` back to `verified`.
    pub async fn expire_elapsed(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<certificate::Model>, StoreError> {
        let elapsed = certificate::Entity::find()
            .filter(certificate::Column::Status.eq(CertificateStatus::Active))
            .filter(certificate::Column::NotAfter.lte(now))
            .all(&self.db)
            .await?;

        let mut expired = Vec::with_capacity(elapsed.len());
        for cert in elapsed {
            let txn = self.db.begin().await?;

            let res = certificate::Entity::update_many()
                .col_expr(
                    certificate::Column::Status,
                    Expr::value(CertificateStatus::Expired),
                )
                .col_expr(certificate::Column::UpdatedAt, Expr::value(now))
                .filter(certificate::Column::Id.eq(cert.id.as_str()))
                .filter(certificate::Column::Status.eq(CertificateStatus::Active))
                .exec(&txn)
                .await?;
            if res.rows_affected == 0 {
                continue;
            }

            domain::Entity::update_many()
                .col_expr(
                    domain::Column::CertificateId,
                    Expr::value(Option::<String>::None),
                )
                .col_expr(domain::Column::Status, Expr::value(DomainStatus::Verified))
                .col_expr(domain::Column::UpdatedAt, Expr::value(now))
                .filter(domain::Column::CertificateId.eq(cert.id.as_str()))
                .filter(domain::Column::Status.eq(DomainStatus::Active))
                .exec(&txn)
                .await?;
            // Non-active domains (uploaded before verification) just lose the reference
            domain::Entity::update_many()
                .col_expr(
                    domain::Column::CertificateId,
                    Expr::value(Option::<String>::None),
                )
                .filter(domain::Column::CertificateId.eq(cert.id.as_str()))
                .exec(&txn)
                .await?;

            txn.commit().await?;

            info!(domain = %cert.domain, certificate_id = %cert.id, "Certificate expired");
            expired.push(cert);
        }

        if !expired.is_empty() {
            self.signal.notify();
        }
        Ok(expired)
    }

    /// Re-activate the most recent superseded certificate of a domain that is
    /// still within its validity period
    pub async fn rollback(
        &self,
        domain_id: &str,
        now: DateTime<Utc>,
    ) -> Result<certificate::Model, StoreError> {
        let txn = self.db.begin().await?;

        let domain_model = domain::Entity::find_by_id(domain_id.to_string())
            .one(&txn)
            .await?
            .ok_or_else(|| StoreError::not_found("domain", domain_id))?;

        let candidate = certificate::Entity::find()
            .filter(certificate::Column::DomainId.eq(domain_id))
            .filter(certificate::Column::Status.eq(CertificateStatus::Expired))
            .filter(certificate::Column::NotAfter.gt(now))
            .filter(certificate::Column::NotBefore.lte(now))
            .filter(certificate::Column::EncryptedKey.is_not_null())
            .filter(certificate::Column::KeyNonce.is_not_null())
            .order_by_desc(certificate::Column::CreatedAt)
            .all(&txn)
            .await?
            .into_iter()
            .find(|c| Some(&c.id) != domain_model.certificate_id.as_ref())
            .ok_or_else(|| StoreError::InvalidTransition {
                entity: "domain",
                id: domain_id.to_string(),
                to: "rollback",
                reason: "no previous certificate is still valid".to_string(),
            })?;

        let mut active = candidate.into_active_model();
        active.status = Set(CertificateStatus::Active);
        active.updated_at = Set(now);
        let model = active.update(&txn).await?;

        cutover(&txn, &model, now).await?;
        txn.commit().await?;

        info!(domain = %model.domain, certificate_id = %model.id, "Rolled back to previous certificate");
        self.signal.notify();
        Ok(model)
    }

    /// Delete a certificate that no domain currently serves
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let txn = self.db.begin().await?;

        let cert = certificate::Entity::find_by_id(id.to_string())
            .one(&txn)
            .await?
            .ok_or_else(|| StoreError::not_found("certificate", id))?;

        let referenced = domain::Entity::find()
            .filter(domain::Column::CertificateId.eq(id))
            .one(&txn)
            .await?;
        if let Some(domain_model) = referenced {
            return Err(StoreError::Conflict(format!(
                "certificate {} is served by {}",
                cert.id, domain_model.name
            )));
        }

        certificate::Entity::delete_by_id(id.to_string())
            .exec(&txn)
            .await?;
        txn.commit().await?;

        self.signal.notify();
        Ok(())
    }
}

/// Make `new` the domain's only active certificate.
///
/// Expires every other active row of the domain, points the domain at `new`
/// and promotes a `verified` domain to `active`.
async fn cutover<C: ConnectionTrait>(
    conn: &C,
    new: &certificate::Model,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    certificate::Entity::update_many()
        .col_expr(
            certificate::Column::Status,
            Expr::value(CertificateStatus::Expired),
        )
        .col_expr(certificate::Column::UpdatedAt, Expr::value(now))
        .filter(certificate::Column::DomainId.eq(new.domain_id.as_str()))
        .filter(certificate::Column::Status.eq(CertificateStatus::Active))
        .filter(certificate::Column::Id.ne(new.id.as_str()))
        .exec(conn)
        .await?;

    domain::Entity::update_many()
        .col_expr(domain::Column::CertificateId, Expr::value(new.id.clone()))
        .col_expr(domain::Column::UpdatedAt, Expr::value(now))
        .filter(domain::Column::Id.eq(new.domain_id.as_str()))
        .exec(conn)
        .await?;

    domain::Entity::update_many()
        .col_expr(domain::Column::Status, Expr::value(DomainStatus::Active))
        .filter(domain::Column::Id.eq(new.domain_id.as_str()))
        .filter(domain::Column::Status.eq(DomainStatus::Verified))
        .exec(conn)
        .await?;

    Ok(())
}
