//! Lookup indexes used by the scheduler and the reconciler

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Scheduler scans domains by status
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_domains_status")
                    .table(Domains::Table)
                    .col(Domains::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_domain_id")
                    .table(Certificates::Table)
                    .col(Certificates::DomainId)
                    .to_owned(),
            )
            .await?;

        // Renewal and expiry sweeps filter by status and not_after
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_certificates_status_not_after")
                    .table(Certificates::Table)
                    .col(Certificates::Status)
                    .col(Certificates::NotAfter)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_routes_domain_id")
                    .table(Routes::Table)
                    .col(Routes::DomainId)
                    .to_owned(),
            )
            .await?;

        // One route per path on a domain
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_routes_domain_path")
                    .table(Routes::Table)
                    .col(Routes::DomainId)
                    .col(Routes::Path)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_routes_domain_path")
                    .table(Routes::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_routes_domain_id")
                    .table(Routes::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_certificates_status_not_after")
                    .table(Certificates::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_certificates_domain_id")
                    .table(Certificates::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_domains_status")
                    .table(Domains::Table)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Domains {
    Table,
    Status,
}

#[derive(DeriveIden)]
enum Certificates {
    Table,
    DomainId,
    Status,
    NotAfter,
}

#[derive(DeriveIden)]
enum Routes {
    Table,
    DomainId,
    Path,
}
