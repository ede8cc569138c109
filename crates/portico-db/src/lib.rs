//! Persistence layer for the Portico control plane
//!
//! SeaORM entities, migrations and the typed stores used by the verification,
//! certificate and reconciliation components. Every mutating store call emits
//! a [`ChangeSignal`] so the reconciler can wake up without polling.

pub mod entities;
pub mod migrator;
pub mod store;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use tracing::info;

pub use store::{
    certificates::{CertificateStore, IssuedCertificate, UploadedCertificate},
    domains::{DomainStore, NewDomain, VerificationOutcome},
    providers::{DnsProviderStore, NewDnsProvider},
    routes::{NewRoute, RouteStore},
    verifications::VerificationStore,
    ChangeSignal, StoreError, Stores,
};

/// Connect to the database at `url` (`sqlite::memory:`, `sqlite://path?mode=rwc`, `postgres://...`)
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(url.to_string());
    options.sqlx_logging(false);

    // Every pooled connection to an in-memory SQLite database sees its own empty database
    if url.contains(":memory:") {
        options.max_connections(1);
    }

    let db = Database::connect(options).await?;
    info!("Connected to database");
    Ok(db)
}

/// Apply all pending migrations
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    migrator::Migrator::up(db, None).await?;
    info!("Database migrations applied");
    Ok(())
}
