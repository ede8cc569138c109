//! Typed stores over the entity tables
//!
//! Status changes are conditional updates (`WHERE id = ? AND status IN (...)`);
//! a transition that matches no row means another task already moved the entity.

pub mod certificates;
pub mod domains;
pub mod providers;
pub mod routes;
pub mod verifications;

use std::sync::Arc;

use sea_orm::{DatabaseConnection, DbErr, SqlErr};
use thiserror::Error;
use tokio::sync::Notify;

pub use certificates::CertificateStore;
pub use domains::DomainStore;
pub use providers::DnsProviderStore;
pub use routes::RouteStore;
pub use verifications::VerificationStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} {id} cannot move to {to}: {reason}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        to: &'static str,
        reason: String,
    },

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Map unique-constraint violations to [`StoreError::Conflict`]
    pub(crate) fn from_insert(err: DbErr, what: impl FnOnce() -> String) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => StoreError::Conflict(what()),
            _ => StoreError::Database(err),
        }
    }
}

/// Wakes the reconciler after a store mutation.
///
/// Backed by [`Notify::notify_one`], which keeps at most one stored permit:
/// any number of signals raised while the reconciler is busy collapse into a
/// single follow-up wake-up.
#[derive(Clone, Default)]
pub struct ChangeSignal {
    notify: Arc<Notify>,
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Wait for the next signal (returns immediately if one is stored)
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl std::fmt::Debug for ChangeSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSignal").finish_non_exhaustive()
    }
}

/// All stores sharing one connection and one change signal
#[derive(Clone)]
pub struct Stores {
    pub db: DatabaseConnection,
    pub domains: DomainStore,
    pub verifications: VerificationStore,
    pub certificates: CertificateStore,
    pub providers: DnsProviderStore,
    pub routes: RouteStore,
    pub signal: ChangeSignal,
}

impl Stores {
    pub fn new(db: DatabaseConnection) -> Self {
        let signal = ChangeSignal::new();
        Self {
            domains: DomainStore::new(db.clone(), signal.clone()),
            verifications: VerificationStore::new(db.clone()),
            certificates: CertificateStore::new(db.clone(), signal.clone()),
            providers: DnsProviderStore::new(db.clone()),
            routes: RouteStore::new(db.clone(), signal.clone()),
            signal,
            db,
        }
    }
}
